//! In-memory drive backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use lexideck_common::{ContainerId, Error, FileId, Result};

use crate::remote::{ByteStream, DriveAbout, DriveApi, DriveFile, DriveUser, FileQuery, FOLDER_MIME_TYPE};

/// Implicit root folder ID, mirroring the Drive `root` alias.
pub const MEMORY_ROOT_ID: &str = "root";

#[derive(Debug, Clone)]
struct Entry {
    file: DriveFile,
    data: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    list: AtomicUsize,
    create_folder: AtomicUsize,
    create_file: AtomicUsize,
    download: AtomicUsize,
    delete: AtomicUsize,
    auth_failures: AtomicUsize,
}

/// In-memory drive.
///
/// Useful for testing and development. Items live in a flat map keyed by
/// ID, listings come back in map order (unordered), and every call is
/// counted. Optionally only one access token is accepted, which lets tests
/// exercise the refresh path.
pub struct MemoryDrive {
    items: Mutex<HashMap<String, Entry>>,
    accepted_token: RwLock<Option<String>>,
    counters: Counters,
    fail_downloads: AtomicBool,
    offline: AtomicBool,
}

impl MemoryDrive {
    /// Create an empty drive that accepts any token.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            accepted_token: RwLock::new(None),
            counters: Counters::default(),
            fail_downloads: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        }
    }

    /// Create an empty drive that only accepts `token`.
    pub fn with_token(token: &str) -> Self {
        Self {
            accepted_token: RwLock::new(Some(token.to_string())),
            ..Self::new()
        }
    }

    /// Change the accepted token, e.g. to simulate expiry.
    pub async fn set_accepted_token(&self, token: Option<&str>) {
        *self.accepted_token.write().await = token.map(String::from);
    }

    /// Make downloads fail with a network error.
    pub fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Make every call fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.counters.list.load(Ordering::SeqCst)
    }

    pub fn create_folder_calls(&self) -> usize {
        self.counters.create_folder.load(Ordering::SeqCst)
    }

    pub fn create_file_calls(&self) -> usize {
        self.counters.create_file.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.counters.download.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.counters.delete.load(Ordering::SeqCst)
    }

    /// Number of calls rejected for carrying the wrong token.
    pub fn auth_failures(&self) -> usize {
        self.counters.auth_failures.load(Ordering::SeqCst)
    }

    /// Insert a folder directly, bypassing counters.
    pub async fn seed_folder(&self, name: &str, parent: &ContainerId) -> ContainerId {
        let file = Self::new_item(name, FOLDER_MIME_TYPE, parent, None);
        let id = file.container_id();
        self.items.lock().await.insert(file.id.clone(), Entry { file, data: Vec::new() });
        id
    }

    /// Insert a file directly, bypassing counters.
    pub async fn seed_file(&self, name: &str, parent: &ContainerId, data: &[u8]) -> FileId {
        let file = Self::new_item(name, "application/octet-stream", parent, Some(data.len()));
        let id = file.file_id();
        self.items.lock().await.insert(
            file.id.clone(),
            Entry {
                file,
                data: data.to_vec(),
            },
        );
        id
    }

    /// Walk `path` from the root and return the item, if present.
    ///
    /// With duplicate names the first match in map order wins.
    pub async fn lookup(&self, path: &str) -> Option<DriveFile> {
        let items = self.items.lock().await;
        let mut parent = MEMORY_ROOT_ID.to_string();
        let mut found: Option<DriveFile> = None;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = items
                .values()
                .find(|e| !e.file.trashed && e.file.name == segment && e.file.parents.contains(&parent))?;
            parent = next.file.id.clone();
            found = Some(next.file.clone());
        }

        found
    }

    /// Content of the file at `path`.
    pub async fn content(&self, path: &str) -> Option<Vec<u8>> {
        let file = self.lookup(path).await?;
        self.items.lock().await.get(&file.id).map(|e| e.data.clone())
    }

    /// Number of live folders with this name anywhere in the drive.
    pub async fn folder_count(&self, name: &str) -> usize {
        self.items
            .lock()
            .await
            .values()
            .filter(|e| e.file.is_folder() && !e.file.trashed && e.file.name == name)
            .count()
    }

    fn new_item(name: &str, mime_type: &str, parent: &ContainerId, size: Option<usize>) -> DriveFile {
        let now = Utc::now();
        DriveFile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size: size.map(|s| s.to_string()),
            created_time: Some(now),
            modified_time: Some(now),
            parents: vec![parent.as_str().to_string()],
            md5_checksum: None,
            trashed: false,
        }
    }

    async fn check_call(&self, token: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("Connection refused".to_string()));
        }

        if let Some(accepted) = self.accepted_token.read().await.as_deref() {
            if accepted != token {
                self.counters.auth_failures.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Authentication("Invalid Credentials".to_string()));
            }
        }

        // Give concurrent callers a chance to interleave, like real I/O would.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn file_data(&self, file_id: &FileId) -> Result<Vec<u8>> {
        match self.items.lock().await.get(file_id.as_str()) {
            Some(entry) if !entry.file.is_folder() => Ok(entry.data.clone()),
            Some(_) => Err(Error::InvalidInput("Cannot download a folder".to_string())),
            None => Err(Error::NotFound(format!("File not found: {}", file_id))),
        }
    }
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveApi for MemoryDrive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, token: &str, query: &FileQuery) -> Result<Vec<DriveFile>> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        self.check_call(token).await?;

        let items = self.items.lock().await;
        Ok(items
            .values()
            .filter(|e| query.matches(&e.file))
            .map(|e| e.file.clone())
            .collect())
    }

    async fn create_folder(
        &self,
        token: &str,
        name: &str,
        parent: &ContainerId,
    ) -> Result<DriveFile> {
        self.counters.create_folder.fetch_add(1, Ordering::SeqCst);
        self.check_call(token).await?;

        let file = Self::new_item(name, FOLDER_MIME_TYPE, parent, None);
        self.items.lock().await.insert(
            file.id.clone(),
            Entry {
                file: file.clone(),
                data: Vec::new(),
            },
        );
        Ok(file)
    }

    async fn create_file(
        &self,
        token: &str,
        name: &str,
        parent: &ContainerId,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<DriveFile> {
        self.counters.create_file.fetch_add(1, Ordering::SeqCst);
        self.check_call(token).await?;

        let file = Self::new_item(name, mime_type, parent, Some(data.len()));
        self.items.lock().await.insert(
            file.id.clone(),
            Entry {
                file: file.clone(),
                data,
            },
        );
        Ok(file)
    }

    async fn download(&self, token: &str, file_id: &FileId) -> Result<Vec<u8>> {
        self.counters.download.fetch_add(1, Ordering::SeqCst);
        self.check_call(token).await?;

        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(Error::Network("Download failed: 500".to_string()));
        }

        self.file_data(file_id).await
    }

    async fn download_stream(&self, token: &str, file_id: &FileId) -> Result<ByteStream> {
        let data = self.download(token, file_id).await?;

        // Split in two chunks so consumers exercise reassembly.
        let mid = data.len() / 2;
        let tail = data[mid..].to_vec();
        let mut head = data;
        head.truncate(mid);

        let chunks = vec![Ok(Bytes::from(head)), Ok(Bytes::from(tail))];
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn delete(&self, token: &str, file_id: &FileId) -> Result<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.check_call(token).await?;

        match self.items.lock().await.remove(file_id.as_str()) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("File not found: {}", file_id))),
        }
    }

    async fn about(&self, token: &str) -> Result<DriveAbout> {
        self.check_call(token).await?;

        Ok(DriveAbout {
            user: Some(DriveUser {
                display_name: Some("Memory".to_string()),
                email_address: Some("memory@localhost".to_string()),
            }),
            storage_quota: None,
        })
    }
}
