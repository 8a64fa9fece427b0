//! Local mirror of the remote drive.
//!
//! Synchronous operations are served entirely from this tree so they never
//! wait on the network.

use std::fs;
use std::path::{Component, Path, PathBuf};

use lexideck_common::{Error, Result};

/// On-disk tree rooted at the fallback directory.
///
/// Paths are joined as given apart from separator handling: no character
/// substitution happens here, so local names can differ from remote ones.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    /// Create a mirror rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the mirror.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a logical path to a filesystem path under the root.
    ///
    /// # Errors
    /// - `..` segments, which would escape the root
    pub fn to_fs_path(&self, logical: &str) -> Result<PathBuf> {
        let forward = logical.replace('\\', "/");
        let mut fs_path = self.root.clone();

        for (i, segment) in forward.split('/').enumerate() {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(Error::InvalidInput(format!(
                        "Path escapes the local mirror: {}",
                        logical
                    )))
                }
                s if i == 0 && is_drive_prefix(s) => continue,
                s => fs_path.push(s),
            }
        }

        // Guard against platform-specific prefixes sneaking through `push`.
        if fs_path
            .components()
            .skip(self.root.components().count())
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("Invalid local path: {}", logical)));
        }

        Ok(fs_path)
    }

    /// Whether the mirror holds a file or directory at `logical`.
    ///
    /// Never fails; an unusable path counts as absent.
    pub fn exists(&self, logical: &str) -> bool {
        self.to_fs_path(logical).map(|p| p.exists()).unwrap_or(false)
    }

    /// Whether the mirror holds a regular file at `logical`.
    pub fn has_file(&self, logical: &str) -> bool {
        self.to_fs_path(logical).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Async form of [`LocalMirror::exists`].
    pub async fn exists_async(&self, logical: &str) -> bool {
        match self.to_fs_path(logical) {
            Ok(path) => tokio::fs::metadata(&path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Async form of [`LocalMirror::has_file`].
    pub async fn has_file_async(&self, logical: &str) -> bool {
        match self.to_fs_path(logical) {
            Ok(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Create a directory and all missing parents.
    pub fn mkdir(&self, logical: &str) -> Result<PathBuf> {
        let path = self.to_fs_path(logical)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Write a file, creating parent directories first.
    pub fn write(&self, logical: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.to_fs_path(logical)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Read a file.
    pub async fn read_async(&self, logical: &str) -> Result<Vec<u8>> {
        let path = self.to_fs_path(logical)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Write a file without blocking the runtime.
    pub async fn write_async(&self, logical: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.to_fs_path(logical)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Remove a file. Returns `false` if nothing was there.
    pub async fn remove_async(&self, logical: &str) -> Result<bool> {
        let path = self.to_fs_path(logical)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure a directory exists and return its absolute path.
    pub fn ensure_dir(&self, logical: &str) -> Result<PathBuf> {
        let path = self.mkdir(logical)?;
        Ok(fs::canonicalize(&path)?)
    }
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
