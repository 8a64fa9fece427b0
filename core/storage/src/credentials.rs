//! OAuth2 credential storage and persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use lexideck_common::{Error, Result};

/// Key under which the access token is persisted.
pub const ACCESS_TOKEN_KEY: &str = "GOOGLE_ACCESS_TOKEN";
/// Key under which the refresh token is persisted.
pub const REFRESH_TOKEN_KEY: &str = "GOOGLE_REFRESH_TOKEN";

/// Tokens returned by a successful exchange.
#[derive(Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// OAuth2 client configuration plus the current tokens.
///
/// Secrets are wiped from memory when the credential is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub access_token: String,
    pub refresh_token: String,
    #[zeroize(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lifecycle of the stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No access token yet; the first remote call has to refresh.
    Uninitialized,
    /// Holding a token believed to be valid.
    Initialized,
    /// A refresh exchange is in flight.
    Refreshing,
    /// The last refresh failed; user consent is needed again.
    Failed,
}

/// Exchanges a refresh token for new tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Run one refresh-token exchange.
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens>;

    /// A fresh URL the user can visit to grant access again.
    fn reauthorization_url(&self) -> String;
}

struct StoreInner {
    credential: Credential,
    state: CredentialState,
}

/// Holds the credential for one facade and writes refreshed tokens back to
/// the first configuration file found among `candidates`.
pub struct CredentialStore {
    inner: RwLock<StoreInner>,
    refresh_lock: Mutex<()>,
    candidates: Vec<PathBuf>,
}

impl CredentialStore {
    /// Create a store. `candidates` is the ordered probe list for the
    /// persistence file.
    pub fn new(credential: Credential, candidates: Vec<PathBuf>) -> Self {
        let state = if credential.access_token.is_empty() {
            CredentialState::Uninitialized
        } else {
            CredentialState::Initialized
        };

        Self {
            inner: RwLock::new(StoreInner { credential, state }),
            refresh_lock: Mutex::new(()),
            candidates,
        }
    }

    /// Current access token (may be empty before the first refresh).
    pub async fn access_token(&self) -> String {
        self.inner.read().await.credential.access_token.clone()
    }

    pub async fn refresh_token(&self) -> String {
        self.inner.read().await.credential.refresh_token.clone()
    }

    pub async fn state(&self) -> CredentialState {
        self.inner.read().await.state
    }

    pub async fn set_state(&self, state: CredentialState) {
        self.inner.write().await.state = state;
    }

    /// Copy of the full credential.
    pub async fn snapshot(&self) -> Credential {
        self.inner.read().await.credential.clone()
    }

    /// Serialize refreshes; callers re-check the token after acquiring.
    pub async fn refresh_guard(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }

    /// Install refreshed tokens in memory and persist them.
    ///
    /// Persistence failures are logged and do not undo the in-memory update.
    pub async fn apply(&self, tokens: Tokens) {
        {
            let mut inner = self.inner.write().await;
            inner.credential.access_token = tokens.access_token.clone();
            inner.credential.refresh_token = tokens.refresh_token.clone();
            inner.credential.expires_at = tokens.expires_at;
            inner.state = CredentialState::Initialized;
        }

        if let Err(e) = self.persist().await {
            warn!("Refreshed tokens could not be persisted: {}", e);
        }
    }

    /// First candidate that exists on disk.
    pub fn discover_config_file(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|p| p.is_file()).cloned()
    }

    /// Write the current tokens into the discovered configuration file.
    ///
    /// Rewrites the whole file: existing `KEY=value` lines are replaced in
    /// place and missing keys are appended. When no candidate exists the
    /// first one is created.
    pub async fn persist(&self) -> Result<PathBuf> {
        let target = match self.discover_config_file() {
            Some(path) => path,
            None => self.candidates.first().cloned().ok_or_else(|| {
                Error::Configuration("No credential file candidates configured".to_string())
            })?,
        };

        let (access, refresh) = {
            let inner = self.inner.read().await;
            (
                inner.credential.access_token.clone(),
                inner.credential.refresh_token.clone(),
            )
        };

        let existing = match tokio::fs::read_to_string(&target).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let updated = upsert_env_lines(
            &existing,
            &[(ACCESS_TOKEN_KEY, access.as_str()), (REFRESH_TOKEN_KEY, refresh.as_str())],
        );

        write_replacing(&target, updated.as_bytes()).await?;
        info!("Persisted refreshed tokens to {}", target.display());

        Ok(target)
    }
}

/// Replace `path` through a sibling temporary file and a rename.
async fn write_replacing(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            warn!("Could not remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e.into());
    }
    debug!("Rewrote {}", path.display());
    Ok(())
}

/// Replace or append `KEY=value` lines, keeping every other line as is.
pub fn upsert_env_lines(content: &str, updates: &[(&str, &str)]) -> String {
    let mut seen = vec![false; updates.len()];
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        let key = line.trim_start().split('=').next().unwrap_or("").trim();
        let replacement = updates
            .iter()
            .position(|(k, _)| line.contains('=') && *k == key);

        match replacement {
            Some(i) => {
                seen[i] = true;
                lines.push(format!("{}={}", updates[i].0, updates[i].1));
            }
            None => lines.push(line.to_string()),
        }
    }

    for (i, (key, value)) in updates.iter().enumerate() {
        if !seen[i] {
            lines.push(format!("{}={}", key, value));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn credential(access: &str) -> Credential {
        Credential {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8080/callback".to_string(),
            access_token: access.to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at: None,
        }
    }

    fn tokens(access: &str, refresh: &str) -> Tokens {
        Tokens {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at: None,
        }
    }

    #[test]
    fn test_upsert_replaces_and_appends() {
        let content = "GOOGLE_CLIENT_ID=abc\nGOOGLE_ACCESS_TOKEN=old\n# comment\n";
        let out = upsert_env_lines(
            content,
            &[(ACCESS_TOKEN_KEY, "new"), (REFRESH_TOKEN_KEY, "r1")],
        );
        assert_eq!(
            out,
            "GOOGLE_CLIENT_ID=abc\nGOOGLE_ACCESS_TOKEN=new\n# comment\nGOOGLE_REFRESH_TOKEN=r1\n"
        );
    }

    #[test]
    fn test_upsert_does_not_match_prefixes() {
        let content = "GOOGLE_ACCESS_TOKEN_OLD=keep\n";
        let out = upsert_env_lines(content, &[(ACCESS_TOKEN_KEY, "v")]);
        assert_eq!(out, "GOOGLE_ACCESS_TOKEN_OLD=keep\nGOOGLE_ACCESS_TOKEN=v\n");
    }

    #[test]
    fn test_upsert_empty_file() {
        assert_eq!(upsert_env_lines("", &[("A", "1")]), "A=1\n");
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        // A non-empty directory cannot be replaced by a file.
        let target = temp.path().join(".env");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "x").unwrap();

        let result = write_replacing(&target, b"GOOGLE_ACCESS_TOKEN=live\n").await;

        assert!(result.is_err());
        assert!(!temp.path().join(".env.tmp").exists());
        assert!(target.join("keep").exists());
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let debug = format!("{:?}", credential("super-secret-token"));
        assert!(!debug.contains("super-secret-token"));
        assert!(!debug.contains("secret\""));
        assert!(debug.contains("client"));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let store = CredentialStore::new(credential(""), vec![]);
        assert_eq!(store.state().await, CredentialState::Uninitialized);

        let store = CredentialStore::new(credential("a"), vec![]);
        assert_eq!(store.state().await, CredentialState::Initialized);
    }

    #[tokio::test]
    async fn test_apply_persists_to_first_existing_candidate() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing/.env");
        let existing = temp.path().join(".env");
        std::fs::write(&existing, "GOOGLE_CLIENT_ID=abc\nGOOGLE_ACCESS_TOKEN=old\n").unwrap();

        let store = CredentialStore::new(credential("old"), vec![missing.clone(), existing.clone()]);
        store.apply(tokens("fresh", "refresh-1")).await;

        assert_eq!(store.access_token().await, "fresh");
        assert_eq!(store.refresh_token().await, "refresh-1");
        assert!(!missing.exists());

        let content = std::fs::read_to_string(&existing).unwrap();
        assert!(content.contains("GOOGLE_CLIENT_ID=abc"));
        assert!(content.contains("GOOGLE_ACCESS_TOKEN=fresh"));
        assert!(content.contains("GOOGLE_REFRESH_TOKEN=refresh-1"));
        assert!(!content.contains("old"));
    }

    #[tokio::test]
    async fn test_persist_creates_first_candidate() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("conf/.env");
        let store = CredentialStore::new(credential("a"), vec![first.clone()]);

        let written = store.persist().await.unwrap();
        assert_eq!(written, first);
        let content = std::fs::read_to_string(&first).unwrap();
        assert_eq!(content, "GOOGLE_ACCESS_TOKEN=a\nGOOGLE_REFRESH_TOKEN=refresh-0\n");
    }

    #[tokio::test]
    async fn test_persist_without_candidates_fails() {
        let store = CredentialStore::new(credential("a"), vec![]);
        assert!(matches!(store.persist().await, Err(Error::Configuration(_))));
    }
}
