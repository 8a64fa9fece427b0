//! Remote backend seam.
//!
//! Everything the storage core needs from the cloud drive goes through the
//! [`DriveApi`] trait. Each call takes the access token explicitly so the
//! retrying wrapper can swap tokens between attempts.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use lexideck_common::{ContainerId, FileId, Result};

/// MIME type the drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Byte stream type for downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Item metadata as reported by the drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// Item ID.
    pub id: String,
    /// Item name (a single path segment).
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes as a decimal string (files only).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }

    /// This item's ID as a folder reference.
    pub fn container_id(&self) -> ContainerId {
        ContainerId::new(self.id.clone())
    }

    /// This item's ID as a file reference.
    pub fn file_id(&self) -> FileId {
        FileId::new(self.id.clone())
    }
}

/// Which kind of item a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Folder,
    File,
    Any,
}

/// A listing request: non-trashed children of one parent, optionally
/// filtered by exact name and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileQuery {
    pub parent: ContainerId,
    pub name: Option<String>,
    pub kind: ItemKind,
}

impl FileQuery {
    /// All non-trashed children of `parent`.
    pub fn children(parent: &ContainerId) -> Self {
        Self {
            parent: parent.clone(),
            name: None,
            kind: ItemKind::Any,
        }
    }

    /// Folders called `name` directly under `parent`.
    pub fn folder_named(parent: &ContainerId, name: &str) -> Self {
        Self {
            parent: parent.clone(),
            name: Some(name.to_string()),
            kind: ItemKind::Folder,
        }
    }

    /// Non-folder items called `name` directly under `parent`.
    pub fn file_named(parent: &ContainerId, name: &str) -> Self {
        Self {
            parent: parent.clone(),
            name: Some(name.to_string()),
            kind: ItemKind::File,
        }
    }

    /// Render as a Drive v3 `q` expression.
    pub fn to_drive_query(&self) -> String {
        let mut clauses = vec![format!("'{}' in parents", escape_literal(self.parent.as_str()))];

        if let Some(name) = &self.name {
            clauses.push(format!("name = '{}'", escape_literal(name)));
        }

        match self.kind {
            ItemKind::Folder => clauses.push(format!("mimeType = '{}'", FOLDER_MIME_TYPE)),
            ItemKind::File => clauses.push(format!("mimeType != '{}'", FOLDER_MIME_TYPE)),
            ItemKind::Any => {}
        }

        clauses.push("trashed = false".to_string());
        clauses.join(" and ")
    }

    /// Evaluate the query against an item, for backends without a query
    /// language.
    pub fn matches(&self, file: &DriveFile) -> bool {
        if file.trashed || !file.parents.iter().any(|p| p == self.parent.as_str()) {
            return false;
        }
        if let Some(name) = &self.name {
            if &file.name != name {
                return false;
            }
        }
        match self.kind {
            ItemKind::Folder => file.is_folder(),
            ItemKind::File => !file.is_folder(),
            ItemKind::Any => true,
        }
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Account information from the drive's `about` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveAbout {
    #[serde(default)]
    pub user: Option<DriveUser>,
    #[serde(default)]
    pub storage_quota: Option<StorageQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

/// Quota figures are decimal strings in the Drive API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuota {
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
}

/// Remote drive operations used by the storage core.
///
/// Implementations report a rejected token as
/// [`Error::Authentication`](lexideck_common::Error::Authentication) and
/// must not retry on their own.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Backend name for logs (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// List items matching `query`, in the backend's own order.
    async fn list(&self, token: &str, query: &FileQuery) -> Result<Vec<DriveFile>>;

    /// Create a folder under `parent`.
    async fn create_folder(&self, token: &str, name: &str, parent: &ContainerId)
        -> Result<DriveFile>;

    /// Create a new file under `parent` with the given content.
    async fn create_file(
        &self,
        token: &str,
        name: &str,
        parent: &ContainerId,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<DriveFile>;

    /// Download complete file content.
    async fn download(&self, token: &str, file_id: &FileId) -> Result<Vec<u8>>;

    /// Download file content as a stream.
    async fn download_stream(&self, token: &str, file_id: &FileId) -> Result<ByteStream>;

    /// Delete a file.
    async fn delete(&self, token: &str, file_id: &FileId) -> Result<()>;

    /// Lightweight identity/quota call used for health checks.
    async fn about(&self, token: &str) -> Result<DriveAbout>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, mime: &str, parent: &str, trashed: bool) -> DriveFile {
        DriveFile {
            id: format!("id-{}", name),
            name: name.to_string(),
            mime_type: mime.to_string(),
            size: None,
            created_time: None,
            modified_time: None,
            parents: vec![parent.to_string()],
            md5_checksum: None,
            trashed,
        }
    }

    #[test]
    fn test_folder_query_string() {
        let query = FileQuery::folder_named(&ContainerId::new("root"), "docs");
        assert_eq!(
            query.to_drive_query(),
            "'root' in parents and name = 'docs' and mimeType = 'application/vnd.google-apps.folder' and trashed = false"
        );
    }

    #[test]
    fn test_query_escapes_quotes() {
        let query = FileQuery::file_named(&ContainerId::new("p1"), "it's.txt");
        let q = query.to_drive_query();
        assert!(q.contains("name = 'it\\'s.txt'"));
        assert!(q.contains("mimeType != "));
    }

    #[test]
    fn test_query_matches() {
        let parent = ContainerId::new("p");
        let folder = item("docs", FOLDER_MIME_TYPE, "p", false);
        let file = item("docs", "text/plain", "p", false);
        let trashed = item("docs", "text/plain", "p", true);
        let elsewhere = item("docs", "text/plain", "q", false);

        let folders = FileQuery::folder_named(&parent, "docs");
        assert!(folders.matches(&folder));
        assert!(!folders.matches(&file));

        let files = FileQuery::file_named(&parent, "docs");
        assert!(files.matches(&file));
        assert!(!files.matches(&trashed));
        assert!(!files.matches(&elsewhere));

        assert!(FileQuery::children(&parent).matches(&folder));
    }

    #[test]
    fn test_drive_file_size_bytes() {
        let mut file = item("a.txt", "text/plain", "p", false);
        file.size = Some("12345".to_string());
        assert_eq!(file.size_bytes(), Some(12345));
        assert!(!file.is_folder());
    }
}
