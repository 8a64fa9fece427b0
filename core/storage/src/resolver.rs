//! Resolution of logical paths into remote folder IDs.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use lexideck_common::{ContainerId, Error, FileId, LogicalPath, Result};

use crate::remote::FileQuery;
use crate::retry::RetryingClient;

type FolderKey = (ContainerId, String);

/// Walks logical paths through the remote folder hierarchy.
///
/// Folder lookups are memoized per `(parent, name)` for the resolver's
/// lifetime and never invalidated; folders are assumed not to be renamed
/// or deleted behind our back. Files are always looked up fresh.
pub struct FolderResolver {
    client: Arc<RetryingClient>,
    root_id: ContainerId,
    base_path: LogicalPath,
    /// One cell per key: concurrent misses on the same key wait for a
    /// single lookup instead of each creating a folder.
    cache: Mutex<HashMap<FolderKey, Arc<OnceCell<ContainerId>>>>,
}

impl FolderResolver {
    pub fn new(client: Arc<RetryingClient>, root_id: ContainerId, base_path: LogicalPath) -> Self {
        Self {
            client,
            root_id,
            base_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve (creating as needed) the folder for `path` under the base
    /// path. The root path resolves to the base folder.
    pub async fn resolve_folder(&self, path: &LogicalPath) -> Result<ContainerId> {
        let full = self.base_path.join(path);
        let mut current = self.root_id.clone();

        for segment in full.segments() {
            current = self.find_or_create_folder(segment, &current).await?;
        }

        debug!("Resolved folder {} -> {}", full, current);
        Ok(current)
    }

    /// Return the folder called `name` under `parent`, creating it if the
    /// remote has none.
    pub async fn find_or_create_folder(&self, name: &str, parent: &ContainerId) -> Result<ContainerId> {
        let cell = {
            let mut cache = self.cache.lock().await;
            cache
                .entry((parent.clone(), name.to_string()))
                .or_default()
                .clone()
        };

        if let Some(id) = cell.get() {
            debug!("Folder cache hit: {}/{}", parent, name);
            return Ok(id.clone());
        }

        let id = cell
            .get_or_try_init(|| async {
                let existing = self
                    .client
                    .list(&FileQuery::folder_named(parent, name))
                    .await?;

                if let Some(folder) = existing.into_iter().next() {
                    debug!("Found folder {} under {}: {}", name, parent, folder.id);
                    return Ok(folder.container_id());
                }

                let created = self.client.create_folder(name, parent).await?;
                debug!("Created folder {} under {}: {}", name, parent, created.id);
                Ok::<_, Error>(created.container_id())
            })
            .await?;

        Ok(id.clone())
    }

    /// Look up a non-folder item called `name` under `parent`. Never cached.
    pub async fn find_file(&self, name: &str, parent: &ContainerId) -> Result<Option<FileId>> {
        let files = self.client.list(&FileQuery::file_named(parent, name)).await?;
        Ok(files.into_iter().next().map(|f| f.file_id()))
    }

    /// Resolve the parent folder of `path` and return it with the file name.
    ///
    /// Returns `None` for the root path, which names no file.
    pub async fn resolve_parent(&self, path: &LogicalPath) -> Result<Option<(ContainerId, String)>> {
        let Some((parent, name)) = path.split_last() else {
            return Ok(None);
        };
        let name = name.to_string();
        let parent_id = self.resolve_folder(&parent).await?;
        Ok(Some((parent_id, name)))
    }

    /// Resolve `raw` to a file ID, or `None` if no such file exists.
    ///
    /// Parent folders are resolved with [`Self::resolve_folder`] and so are
    /// created if missing.
    pub async fn path_to_file_id(&self, raw: &str) -> Result<Option<FileId>> {
        let path = LogicalPath::parse(raw);
        match self.resolve_parent(&path).await? {
            Some((parent_id, name)) => self.find_file(&name, &parent_id).await,
            None => Ok(None),
        }
    }

    /// Number of memoized folder lookups.
    pub async fn cached_folders(&self) -> usize {
        self.cache
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Root ID all paths start from.
    pub fn root_id(&self) -> &ContainerId {
        &self.root_id
    }
}
