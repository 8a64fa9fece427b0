//! Storage configuration.
//!
//! Every recognized option is enumerated here and defaulted at load time.
//! Configuration can come from JSON, from a `KEY=value` file or from the
//! process environment. Loading never checks for credentials; that happens
//! in [`StorageConfig::validate`] when a facade is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lexideck_common::{Error, LogicalPath, Result};

use crate::credentials::Credential;
use crate::gdrive::auth::{AuthConfig, DEFAULT_REDIRECT_URL, DRIVE_FILE_SCOPE};

/// Prefix for short scope names such as `drive.file`.
const SCOPE_PREFIX: &str = "https://www.googleapis.com/auth/";

/// Directory name used under the platform config dir.
const APP_DIR: &str = "lexideck";

/// Typed storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// May be empty; the first remote call then refreshes.
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default = "default_root_container_id")]
    pub root_container_id: String,
    /// Logical root under which every path is resolved.
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub fallback_to_local: bool,
    #[serde(default = "default_local_fallback_path")]
    pub local_fallback_path: PathBuf,
    /// Ordered probe list for the file refreshed tokens are written to.
    #[serde(default = "default_credential_files")]
    pub credential_files: Vec<PathBuf>,
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URL.to_string()
}

fn default_root_container_id() -> String {
    "root".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![DRIVE_FILE_SCOPE.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_local_fallback_path() -> PathBuf {
    PathBuf::from("./fallback-storage")
}

/// Working directory, two ancestors, then the per-user config directory.
pub fn default_credential_files() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("./.env"),
        PathBuf::from("../.env"),
        PathBuf::from("../../.env"),
    ];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join(APP_DIR).join(".env"));
    }
    candidates
}

impl StorageConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid storage config: {}", e)))
    }

    /// Load from a `KEY=value` file.
    ///
    /// The file itself becomes the first credential file candidate so that
    /// refreshed tokens land where they were read from.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let vars = parse_env_lines(&content);

        let mut config = Self::from_lookup(|key| vars.get(key).cloned())?;
        config.credential_files.insert(0, path.to_path_buf());
        Ok(config)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let fallback_to_local = match get("STORAGE_FALLBACK_TO_LOCAL") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                Error::Configuration(format!(
                    "STORAGE_FALLBACK_TO_LOCAL must be true or false, got {:?}",
                    value
                ))
            })?,
            None => true,
        };

        let scopes = match get("GOOGLE_SCOPES") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(expand_scope)
                .collect(),
            None => default_scopes(),
        };

        let config = Self {
            client_id: get("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: get("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: get("GOOGLE_REDIRECT_URI").unwrap_or_else(default_redirect_uri),
            access_token: get("GOOGLE_ACCESS_TOKEN").unwrap_or_default(),
            refresh_token: get("GOOGLE_REFRESH_TOKEN").unwrap_or_default(),
            root_container_id: get("GOOGLE_DRIVE_ROOT_ID").unwrap_or_else(default_root_container_id),
            base_path: get("STORAGE_BASE_PATH").unwrap_or_default(),
            scopes,
            fallback_to_local,
            local_fallback_path: get("STORAGE_LOCAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_local_fallback_path),
            credential_files: default_credential_files(),
        };

        Ok(config)
    }

    /// Check that the required credentials are present.
    ///
    /// # Errors
    /// - `Configuration` naming every missing field
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("refresh_token", &self.refresh_token),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "Missing required credentials: {}",
                missing.join(", ")
            )))
        }
    }

    /// OAuth2 settings for the auth manager.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_url: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }

    /// Initial credential for the credential store.
    pub fn credential(&self) -> Credential {
        Credential {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: None,
        }
    }

    pub fn base_path(&self) -> LogicalPath {
        LogicalPath::parse(&self.base_path)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn expand_scope(scope: &str) -> String {
    if scope.starts_with("https://") {
        scope.to_string()
    } else {
        format!("{}{}", SCOPE_PREFIX, scope)
    }
}

/// Parse `KEY=value` lines.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is allowed
/// and matching surrounding quotes are removed from values.
pub fn parse_env_lines(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
