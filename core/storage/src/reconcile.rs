//! Presence-based reconciliation for asynchronous writes.
//!
//! Whichever side already holds a copy of a file is treated as authoritative.
//! Content and timestamps are never compared.

use std::sync::Arc;
use tracing::{debug, info, warn};

use lexideck_common::{Error, FileId, LogicalPath, Result};

use crate::local::LocalMirror;
use crate::resolver::FolderResolver;
use crate::retry::RetryingClient;

/// What a reconciled write ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Both sides already had the file; nothing was transferred.
    AlreadySynced(FileId),
    /// The local copy was uploaded to the remote.
    PushedLocal(FileId),
    /// The remote copy was downloaded into the local mirror.
    PulledRemote(FileId),
    /// Neither side had it; the payload was written to both.
    Created(FileId),
}

impl WriteOutcome {
    pub fn file_id(&self) -> &FileId {
        match self {
            WriteOutcome::AlreadySynced(id)
            | WriteOutcome::PushedLocal(id)
            | WriteOutcome::PulledRemote(id)
            | WriteOutcome::Created(id) => id,
        }
    }

    pub fn into_file_id(self) -> FileId {
        match self {
            WriteOutcome::AlreadySynced(id)
            | WriteOutcome::PushedLocal(id)
            | WriteOutcome::PulledRemote(id)
            | WriteOutcome::Created(id) => id,
        }
    }
}

/// Decides between push, pull and create for one write.
pub struct Reconciler {
    client: Arc<RetryingClient>,
    resolver: Arc<FolderResolver>,
    /// `None` when local fallback is disabled; the engine is then remote-only.
    mirror: Option<LocalMirror>,
}

impl Reconciler {
    pub fn new(
        client: Arc<RetryingClient>,
        resolver: Arc<FolderResolver>,
        mirror: Option<LocalMirror>,
    ) -> Self {
        Self {
            client,
            resolver,
            mirror,
        }
    }

    /// Reconcile `raw_path` between the mirror and the remote, using
    /// `payload` only when neither side has the file.
    ///
    /// The mirror is addressed with the path as given; the remote with its
    /// normalized form.
    pub async fn write(&self, raw_path: &str, payload: &[u8], mime_type: &str) -> Result<WriteOutcome> {
        let path = LogicalPath::parse(raw_path);
        let (parent_id, name) = self
            .resolver
            .resolve_parent(&path)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {:?}", raw_path)))?;

        let local = match &self.mirror {
            Some(mirror) if mirror.has_file_async(raw_path).await => Some(mirror),
            _ => None,
        };

        if let Some(mirror) = local {
            if let Some(id) = self.resolver.find_file(&name, &parent_id).await? {
                debug!("{} already present on both sides", path);
                return Ok(WriteOutcome::AlreadySynced(id));
            }

            let bytes = mirror.read_async(raw_path).await?;
            let created = self
                .client
                .create_file(&name, &parent_id, bytes, mime_type)
                .await?;
            info!("Pushed local copy of {} to remote", path);
            return Ok(WriteOutcome::PushedLocal(created.file_id()));
        }

        if let Some(id) = self.resolver.find_file(&name, &parent_id).await? {
            let Some(mirror) = &self.mirror else {
                // Remote-only: the remote copy wins and nothing is fetched.
                debug!("{} already present on remote", path);
                return Ok(WriteOutcome::AlreadySynced(id));
            };

            match self.client.download(&id).await {
                Ok(bytes) => {
                    mirror.write_async(raw_path, &bytes).await?;
                    info!("Pulled remote copy of {} into local mirror", path);
                    return Ok(WriteOutcome::PulledRemote(id));
                }
                Err(e) => {
                    warn!("Download of {} failed, writing payload instead: {}", path, e);
                }
            }
        }

        let created = self
            .client
            .create_file(&name, &parent_id, payload.to_vec(), mime_type)
            .await?;
        if let Some(mirror) = &self.mirror {
            mirror.write_async(raw_path, payload).await?;
        }
        debug!("Created {} on remote ({})", path, created.id);

        Ok(WriteOutcome::Created(created.file_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialStore, TokenRefresher, Tokens};
    use crate::memory::{MemoryDrive, MEMORY_ROOT_ID};
    use async_trait::async_trait;
    use lexideck_common::ContainerId;
    use tempfile::TempDir;

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _refresh_token: &str) -> Result<Tokens> {
            Err(Error::Authentication("refresh disabled".to_string()))
        }

        fn reauthorization_url(&self) -> String {
            "https://accounts.example.test/auth".to_string()
        }
    }

    fn reconciler(drive: Arc<MemoryDrive>, mirror: Option<LocalMirror>) -> Reconciler {
        let credential = Credential {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8080/callback".to_string(),
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: None,
        };
        let store = Arc::new(CredentialStore::new(credential, vec![]));
        let client = Arc::new(RetryingClient::new(drive, store, Arc::new(NoRefresh)));
        let resolver = Arc::new(FolderResolver::new(
            client.clone(),
            ContainerId::new(MEMORY_ROOT_ID),
            LogicalPath::root(),
        ));
        Reconciler::new(client, resolver, mirror)
    }

    const TEXT: &str = "text/plain";

    #[tokio::test]
    async fn test_local_only_is_pushed() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        mirror.write("notes/todo.txt", b"buy milk").unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let engine = reconciler(drive.clone(), Some(mirror));

        let outcome = engine.write("notes/todo.txt", b"ignored", TEXT).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::PushedLocal(_)));
        assert_eq!(drive.content("notes/todo.txt").await.unwrap(), b"buy milk");
    }

    #[tokio::test]
    async fn test_remote_only_is_pulled() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        let drive = Arc::new(MemoryDrive::new());
        let notes = drive.seed_folder("notes", &ContainerId::new(MEMORY_ROOT_ID)).await;
        let id = drive.seed_file("todo.txt", &notes, b"buy milk").await;
        let engine = reconciler(drive.clone(), Some(mirror.clone()));

        let outcome = engine.write("notes/todo.txt", b"ignored", TEXT).await.unwrap();

        assert_eq!(outcome, WriteOutcome::PulledRemote(id));
        assert_eq!(
            std::fs::read(temp.path().join("notes/todo.txt")).unwrap(),
            b"buy milk"
        );
        assert_eq!(drive.create_file_calls(), 0);
    }

    #[tokio::test]
    async fn test_both_sides_present_is_noop() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        mirror.write("a.txt", b"local").unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let id = drive
            .seed_file("a.txt", &ContainerId::new(MEMORY_ROOT_ID), b"remote")
            .await;
        let engine = reconciler(drive.clone(), Some(mirror));

        let outcome = engine.write("a.txt", b"payload", TEXT).await.unwrap();

        assert_eq!(outcome, WriteOutcome::AlreadySynced(id));
        assert_eq!(drive.create_file_calls(), 0);
        assert_eq!(drive.download_calls(), 0);
        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_neither_side_creates_both() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        let engine = reconciler(drive.clone(), Some(LocalMirror::new(temp.path())));

        let outcome = engine.write("decks/n5.json", b"{}", "application/json").await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Created(_)));
        assert_eq!(drive.content("decks/n5.json").await.unwrap(), b"{}");
        assert_eq!(std::fs::read(temp.path().join("decks/n5.json")).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_failed_download_falls_through_to_create() {
        let temp = TempDir::new().unwrap();
        let drive = Arc::new(MemoryDrive::new());
        drive
            .seed_file("a.txt", &ContainerId::new(MEMORY_ROOT_ID), b"remote")
            .await;
        drive.set_fail_downloads(true);
        let engine = reconciler(drive.clone(), Some(LocalMirror::new(temp.path())));

        let outcome = engine.write("a.txt", b"payload", TEXT).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Created(_)));
        assert_eq!(drive.download_calls(), 1);
        assert_eq!(drive.create_file_calls(), 1);
        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_without_mirror_is_remote_only() {
        let drive = Arc::new(MemoryDrive::new());
        let engine = reconciler(drive.clone(), None);

        let first = engine.write("a.txt", b"hi", TEXT).await.unwrap();
        assert!(matches!(first, WriteOutcome::Created(_)));

        let second = engine.write("a.txt", b"other", TEXT).await.unwrap();
        assert_eq!(second, WriteOutcome::AlreadySynced(first.into_file_id()));
        assert_eq!(drive.content("a.txt").await.unwrap(), b"hi");
        assert_eq!(drive.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_only_never_duplicates_existing_file() {
        let drive = Arc::new(MemoryDrive::new());
        let id = drive
            .seed_file("a.txt", &ContainerId::new(MEMORY_ROOT_ID), b"remote")
            .await;
        drive.set_fail_downloads(true);
        let engine = reconciler(drive.clone(), None);

        let outcome = engine.write("a.txt", b"new", TEXT).await.unwrap();

        assert_eq!(outcome, WriteOutcome::AlreadySynced(id));
        assert_eq!(drive.download_calls(), 0);
        assert_eq!(drive.create_file_calls(), 0);
        assert_eq!(drive.content("a.txt").await.unwrap(), b"remote");
    }

    #[tokio::test]
    async fn test_root_path_is_rejected() {
        let drive = Arc::new(MemoryDrive::new());
        let engine = reconciler(drive, None);

        assert!(matches!(
            engine.write("/", b"x", TEXT).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
