//! Public storage surface.
//!
//! Synchronous operations are local-first: they complete against the
//! [`LocalMirror`] and queue a best-effort remote "shadow write" whose
//! failure never reaches the caller. Asynchronous operations treat the
//! remote as authoritative and surface every unrecovered error.

use base64::Engine;
use futures::{stream, StreamExt, TryStreamExt};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use lexideck_common::{ContainerId, Error, FileId, LogicalPath, Result};

use crate::config::StorageConfig;
use crate::credentials::{CredentialState, CredentialStore, TokenRefresher};
use crate::gdrive::{AuthManager, DriveClient};
use crate::local::LocalMirror;
use crate::reconcile::Reconciler;
use crate::remote::{ByteStream, DriveApi, FileQuery};
use crate::resolver::FolderResolver;
use crate::retry::RetryingClient;

/// Remote operation queued behind a synchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOp {
    Mkdir,
    WriteFile,
}

impl fmt::Display for ShadowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowOp::Mkdir => write!(f, "mkdir"),
            ShadowOp::WriteFile => write!(f, "write_file"),
        }
    }
}

/// Receives the results of shadow writes.
pub trait ShadowWriteObserver: Send + Sync {
    /// A shadow write failed or could not be started.
    fn shadow_write_failed(&self, op: ShadowOp, path: &str, error: &Error);

    /// A shadow write reached the remote.
    fn shadow_write_completed(&self, _op: ShadowOp, _path: &str) {}
}

/// Default observer: logs failures.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ShadowWriteObserver for TracingObserver {
    fn shadow_write_failed(&self, op: ShadowOp, path: &str, error: &Error) {
        warn!("Shadow {} of {} failed: {}", op, path, error);
    }

    fn shadow_write_completed(&self, op: ShadowOp, path: &str) {
        debug!("Shadow {} of {} completed", op, path);
    }
}

/// How caller-supplied data is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Binary,
    Utf8,
    /// Standard base64; decoded before anything is written.
    Base64,
}

impl Encoding {
    fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::Binary => Ok(data.to_vec()),
            Encoding::Utf8 => {
                std::str::from_utf8(data)
                    .map_err(|e| Error::InvalidInput(format!("Data is not valid UTF-8: {}", e)))?;
                Ok(data.to_vec())
            }
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| Error::InvalidInput(format!("Invalid base64 data: {}", e))),
        }
    }
}

/// Options for file writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub encoding: Encoding,
    /// Content type sent to the remote. Derived from the encoding if unset.
    pub mime_type: Option<String>,
}

impl WriteOptions {
    pub fn text() -> Self {
        Self {
            encoding: Encoding::Utf8,
            mime_type: None,
        }
    }

    fn mime_type(&self) -> &str {
        match (&self.mime_type, self.encoding) {
            (Some(mime), _) => mime,
            (None, Encoding::Utf8) => "text/plain",
            (None, _) => "application/octet-stream",
        }
    }
}

/// Result of [`StorageFacade::health_check`].
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub backend: String,
    pub user: Option<String>,
    pub quota_usage: Option<u64>,
    pub quota_limit: Option<u64>,
    pub credential_state: CredentialState,
    /// Absolute mirror root, when local fallback is enabled.
    pub local_root: Option<PathBuf>,
}

struct Inner {
    client: Arc<RetryingClient>,
    resolver: Arc<FolderResolver>,
    reconciler: Reconciler,
    mirror: LocalMirror,
    fallback_to_local: bool,
    shadow_tasks: TaskTracker,
}

/// Dual-backend storage facade.
///
/// Cloning is cheap; clones share the credential store, the folder cache
/// and the set of in-flight shadow writes.
#[derive(Clone)]
pub struct StorageFacade {
    inner: Arc<Inner>,
    observer: Arc<dyn ShadowWriteObserver>,
}

impl StorageFacade {
    /// Build a facade backed by Google Drive.
    ///
    /// # Errors
    /// - `Configuration` if required credentials are missing
    pub fn new(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(DriveClient::new()?);
        let refresher = Arc::new(AuthManager::new(config.auth_config())?);
        Self::with_backend(config, api, refresher)
    }

    /// Build a facade over any remote backend.
    pub fn with_backend(
        config: &StorageConfig,
        api: Arc<dyn DriveApi>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        config.validate()?;

        let credentials = Arc::new(CredentialStore::new(
            config.credential(),
            config.credential_files.clone(),
        ));
        let client = Arc::new(RetryingClient::new(api, credentials, refresher));
        let resolver = Arc::new(FolderResolver::new(
            client.clone(),
            ContainerId::new(config.root_container_id.clone()),
            config.base_path(),
        ));
        let mirror = LocalMirror::new(&config.local_fallback_path);
        let reconciler = Reconciler::new(
            client.clone(),
            resolver.clone(),
            config.fallback_to_local.then(|| mirror.clone()),
        );

        info!(
            "Storage facade ready (backend: {}, local fallback: {})",
            client.backend_name(),
            config.fallback_to_local
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                resolver,
                reconciler,
                mirror,
                fallback_to_local: config.fallback_to_local,
                shadow_tasks: TaskTracker::new(),
            }),
            observer: Arc::new(TracingObserver),
        })
    }

    /// Route shadow-write results to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ShadowWriteObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.inner.client.credentials()
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.inner.mirror
    }

    // Synchronous, local-first operations.

    /// Whether the local mirror holds `path`. Never fails.
    pub fn exists_sync(&self, path: &str) -> bool {
        if !self.inner.fallback_to_local {
            warn!("exists_sync({}) called with local fallback disabled", path);
            return false;
        }
        self.inner.mirror.exists(path)
    }

    /// Create a local directory and queue the remote folder chain.
    pub fn mkdir_sync(&self, path: &str) -> Result<PathBuf> {
        let local = self.inner.mirror.mkdir(path)?;

        let facade = self.clone();
        let owned = path.to_string();
        self.spawn_shadow(ShadowOp::Mkdir, path, async move {
            facade.mkdir(&owned).await.map(|_| ())
        });

        Ok(local)
    }

    /// Write a local file and queue a reconciled remote write.
    pub fn write_file_sync(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> Result<PathBuf> {
        let bytes = options.encoding.decode(data.as_ref())?;
        let local = self.inner.mirror.write(path, &bytes)?;

        let facade = self.clone();
        let owned = path.to_string();
        let mime_type = options.mime_type().to_string();
        self.spawn_shadow(ShadowOp::WriteFile, path, async move {
            facade
                .inner
                .reconciler
                .write(&owned, &bytes, &mime_type)
                .await
                .map(|_| ())
        });

        Ok(local)
    }

    fn spawn_shadow<F>(&self, op: ShadowOp, path: &str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let observer = self.observer.clone();

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                let err = Error::Configuration("No async runtime; shadow write skipped".to_string());
                observer.shadow_write_failed(op, path, &err);
                return;
            }
        };

        let path = path.to_string();
        self.inner.shadow_tasks.spawn_on(
            async move {
                match task.await {
                    Ok(()) => observer.shadow_write_completed(op, &path),
                    Err(e) => observer.shadow_write_failed(op, &path, &e),
                }
            },
            &handle,
        );
    }

    /// Wait for every shadow write queued so far.
    pub async fn flush_shadow_writes(&self) {
        let tasks = &self.inner.shadow_tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    // Asynchronous, remote-authoritative operations.

    /// Whether `path` exists locally or as a remote file.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        if self.inner.fallback_to_local && self.inner.mirror.exists_async(path).await {
            return Ok(true);
        }
        Ok(self.inner.resolver.path_to_file_id(path).await?.is_some())
    }

    /// Resolve (creating as needed) the remote folder chain for `path`.
    pub async fn mkdir(&self, path: &str) -> Result<ContainerId> {
        self.inner
            .resolver
            .resolve_folder(&LogicalPath::parse(path))
            .await
    }

    /// Reconcile `path` between the mirror and the remote.
    ///
    /// `data` is only written when neither side already has the file.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> Result<FileId> {
        let bytes = options.encoding.decode(data.as_ref())?;
        let outcome = self
            .inner
            .reconciler
            .write(path, &bytes, options.mime_type())
            .await?;
        debug!("write_file({}) -> {:?}", path, outcome);
        Ok(outcome.into_file_id())
    }

    /// Names of the remote items directly under `path`, sorted.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let folder = self.mkdir(path).await?;
        let children = self
            .inner
            .client
            .list(&FileQuery::children(&folder))
            .await?;

        let mut names: Vec<String> = children.into_iter().map(|f| f.name).collect();
        names.sort();
        Ok(names)
    }

    /// Delete the remote file at `path` and its local copy.
    ///
    /// # Errors
    /// - `NotFound` if the remote has no such file
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let id = self
            .inner
            .resolver
            .path_to_file_id(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?;

        self.inner.client.delete(&id).await?;
        info!("Deleted {} ({})", path, id);

        match self.inner.mirror.remove_async(path).await {
            Ok(true) => debug!("Removed local copy of {}", path),
            Ok(false) => {}
            Err(e) => warn!("Could not remove local copy of {}: {}", path, e),
        }
        Ok(())
    }

    /// Open a read stream over the remote file at `path`.
    ///
    /// Returns immediately. Resolution, authentication and download happen
    /// when the stream is first polled, and any failure arrives as an `Err`
    /// item.
    pub fn create_read_stream(&self, path: &str) -> ByteStream {
        let facade = self.clone();
        let path = path.to_string();

        Box::pin(stream::once(async move { facade.open_remote(&path).await }).try_flatten())
    }

    async fn open_remote(&self, path: &str) -> Result<ByteStream> {
        let id = self
            .inner
            .resolver
            .path_to_file_id(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?;
        self.inner.client.download_stream(&id).await
    }

    /// Read the whole remote file at `path`.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut stream = self.create_read_stream(path);
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }

    /// Absolute local directory for incoming uploads, created if missing.
    ///
    /// `explicit` takes precedence over the mirror location for `path`.
    pub fn upload_dir(&self, path: &str, explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(std::fs::canonicalize(dir)?)
            }
            None => self.inner.mirror.ensure_dir(path),
        }
    }

    /// Verify local storage, connectivity and authentication without
    /// touching any file.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let local_root = if self.inner.fallback_to_local {
            Some(self.inner.mirror.ensure_dir("")?)
        } else {
            None
        };

        let about = self.inner.client.about().await?;
        let quota = about.storage_quota.as_ref();

        Ok(HealthReport {
            backend: self.inner.client.backend_name().to_string(),
            user: about
                .user
                .as_ref()
                .and_then(|u| u.email_address.clone().or_else(|| u.display_name.clone())),
            quota_usage: quota.and_then(|q| q.usage.as_deref()).and_then(|v| v.parse().ok()),
            quota_limit: quota.and_then(|q| q.limit.as_deref()).and_then(|v| v.parse().ok()),
            credential_state: self.credentials().state().await,
            local_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Tokens;
    use crate::memory::{MemoryDrive, MEMORY_ROOT_ID};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedRefresher;

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<Tokens> {
            Ok(Tokens {
                access_token: "fresh".to_string(),
                refresh_token: "refresh-1".to_string(),
                expires_at: None,
            })
        }

        fn reauthorization_url(&self) -> String {
            "https://accounts.example.test/auth".to_string()
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        failures: Mutex<Vec<(ShadowOp, String)>>,
        completed: Mutex<Vec<(ShadowOp, String)>>,
    }

    impl ShadowWriteObserver for RecordingObserver {
        fn shadow_write_failed(&self, op: ShadowOp, path: &str, _error: &Error) {
            self.failures.lock().unwrap().push((op, path.to_string()));
        }

        fn shadow_write_completed(&self, op: ShadowOp, path: &str) {
            self.completed.lock().unwrap().push((op, path.to_string()));
        }
    }

    fn config(temp: &TempDir, fallback: bool) -> StorageConfig {
        let mut config = StorageConfig::from_json(
            r#"{"client_id":"cid","client_secret":"secret","refresh_token":"refresh","access_token":"fresh"}"#,
        )
        .unwrap();
        config.fallback_to_local = fallback;
        config.local_fallback_path = temp.path().join("fallback");
        config.credential_files = vec![temp.path().join(".env")];
        config
    }

    fn facade(temp: &TempDir, drive: Arc<MemoryDrive>, fallback: bool) -> StorageFacade {
        StorageFacade::with_backend(&config(temp, fallback), drive, Arc::new(FixedRefresher)).unwrap()
    }

    #[test]
    fn test_missing_credentials_fail_construction() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, true);
        config.refresh_token.clear();

        let result = StorageFacade::with_backend(
            &config,
            Arc::new(MemoryDrive::new()),
            Arc::new(FixedRefresher),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_encoding_decode() {
        assert_eq!(Encoding::Base64.decode(b"aGk=").unwrap(), b"hi");
        assert!(Encoding::Base64.decode(b"***").is_err());
        assert!(Encoding::Utf8.decode(&[0xff, 0xfe]).is_err());
        assert_eq!(Encoding::Binary.decode(&[0xff]).unwrap(), vec![0xff]);
    }

    #[test]
    fn test_exists_sync_reflects_mirror() {
        let temp = TempDir::new().unwrap();
        let storage = facade(&temp, Arc::new(MemoryDrive::new()), true);

        assert!(!storage.exists_sync("notes/todo.txt"));
        std::fs::create_dir_all(temp.path().join("fallback/notes")).unwrap();
        std::fs::write(temp.path().join("fallback/notes/todo.txt"), b"x").unwrap();
        assert!(storage.exists_sync("notes/todo.txt"));
        assert!(storage.exists_sync("notes"));
        assert!(!storage.exists_sync("../etc/passwd"));
    }

    #[test]
    fn test_exists_sync_disabled_fallback_is_false() {
        let temp = TempDir::new().unwrap();
        let storage = facade(&temp, Arc::new(MemoryDrive::new()), false);
        std::fs::create_dir_all(temp.path().join("fallback")).unwrap();
        std::fs::write(temp.path().join("fallback/a.txt"), b"x").unwrap();

        assert!(!storage.exists_sync("a.txt"));
    }

    #[test]
    fn test_sync_write_without_runtime_reports_skip() {
        let temp = TempDir::new().unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let storage =
            facade(&temp, Arc::new(MemoryDrive::new()), true).with_observer(observer.clone());

        let path = storage.write_file_sync("a.txt", "hi", &WriteOptions::text()).unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"hi");
        assert_eq!(
            *observer.failures.lock().unwrap(),
            vec![(ShadowOp::WriteFile, "a.txt".to_string())]
        );
    }

    #[tokio::test]
    async fn test_mkdir_sync_shadows_remote_folders() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), true);

        let local = storage.mkdir_sync("decks/n5").unwrap();
        assert!(local.is_dir());

        storage.flush_shadow_writes().await;
        assert!(drive.lookup("decks/n5").await.unwrap().is_folder());
    }

    #[tokio::test]
    async fn test_write_file_sync_base64() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), true);
        let options = WriteOptions {
            encoding: Encoding::Base64,
            mime_type: Some("audio/mpeg".to_string()),
        };

        let local = storage.write_file_sync("media/a.mp3", "AAEC", &options).unwrap();
        assert_eq!(std::fs::read(local).unwrap(), vec![0, 1, 2]);

        storage.flush_shadow_writes().await;
        let remote = drive.lookup("media/a.mp3").await.unwrap();
        assert_eq!(remote.mime_type, "audio/mpeg");
        assert_eq!(drive.content("media/a.mp3").await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_exists_checks_local_then_remote() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        drive
            .seed_file("remote.txt", &ContainerId::new(MEMORY_ROOT_ID), b"r")
            .await;
        let storage = facade(&temp, drive.clone(), true);
        storage.mirror().write("local.txt", b"l").unwrap();

        assert!(storage.exists("local.txt").await.unwrap());
        assert_eq!(drive.list_calls(), 0);
        assert!(storage.exists("remote.txt").await.unwrap());
        assert!(!storage.exists("missing.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_chains_three_segments() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), true);

        let id = storage.mkdir("a/b/c").await.unwrap();

        assert_eq!(drive.create_folder_calls(), 3);
        assert_eq!(drive.lookup("a/b/c").await.unwrap().container_id(), id);
    }

    #[tokio::test]
    async fn test_readdir_is_sorted() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), true);
        let files = storage.mkdir("files").await.unwrap();
        for name in ["zeta.txt", "alpha.txt", "Mid.txt"] {
            drive.seed_file(name, &files, b"x").await;
        }
        drive.seed_folder("beta", &files).await;

        let names = storage.readdir("/files/").await.unwrap();

        assert_eq!(names, vec!["Mid.txt", "alpha.txt", "beta", "zeta.txt"]);
    }

    #[tokio::test]
    async fn test_unlink_removes_remote_and_local() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), true);
        storage
            .write_file("files/a.txt", "hello", &WriteOptions::text())
            .await
            .unwrap();
        assert!(storage.exists_sync("files/a.txt"));

        storage.unlink("files/a.txt").await.unwrap();

        assert!(drive.lookup("files/a.txt").await.is_none());
        assert!(!storage.exists_sync("files/a.txt"));
        assert!(matches!(
            storage.unlink("files/a.txt").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_stream_defers_errors() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        drive.set_offline(true);
        let storage = facade(&temp, drive.clone(), true);

        let mut stream = storage.create_read_stream("files/a.txt");
        assert_eq!(drive.list_calls(), 0);

        match stream.next().await {
            Some(Err(Error::Network(_))) => {}
            other => panic!("expected a network error item, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn test_read_file_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let storage = facade(&temp, Arc::new(MemoryDrive::new()), true);

        assert!(matches!(
            storage.read_file("files/none.txt").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_file_reassembles_chunks() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let storage = facade(&temp, drive.clone(), false);
        storage
            .write_file("subs/ep1.srt", "1\n00:00:01,000 --> 00:00:02,000\nhi\n", &WriteOptions::text())
            .await
            .unwrap();

        let data = storage.read_file("subs/ep1.srt").await.unwrap();
        assert_eq!(data, b"1\n00:00:01,000 --> 00:00:02,000\nhi\n");
    }

    #[test]
    fn test_upload_dir() {
        let temp = TempDir::new().unwrap();
        let storage = facade(&temp, Arc::new(MemoryDrive::new()), true);

        let dir = storage.upload_dir("uploads", None).unwrap();
        assert!(dir.is_absolute() && dir.is_dir());
        assert!(dir.ends_with("fallback/uploads"));

        let explicit = temp.path().join("incoming");
        let dir = storage.upload_dir("uploads", Some(&explicit)).unwrap();
        assert!(dir.ends_with("incoming") && dir.is_dir());
    }

    #[tokio::test]
    async fn test_health_check() {
        let temp = TempDir::new().unwrap();
        let storage = facade(&temp, Arc::new(MemoryDrive::new()), true);

        let report = storage.health_check().await.unwrap();

        assert_eq!(report.backend, "memory");
        assert_eq!(report.user.as_deref(), Some("memory@localhost"));
        assert_eq!(report.credential_state, CredentialState::Initialized);
        assert!(report.local_root.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_health_check_refreshes_expired_token() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::with_token("fresh"));
        let mut config = config(&temp, false);
        config.access_token = "expired".to_string();
        let storage =
            StorageFacade::with_backend(&config, drive.clone(), Arc::new(FixedRefresher)).unwrap();

        let report = storage.health_check().await.unwrap();

        assert!(report.local_root.is_none());
        assert_eq!(drive.auth_failures(), 1);
        assert_eq!(storage.credentials().access_token().await, "fresh");
        let persisted = std::fs::read_to_string(temp.path().join(".env")).unwrap();
        assert!(persisted.contains("GOOGLE_ACCESS_TOKEN=fresh"));
    }
}
