//! Common error types for Lexideck storage.

use thiserror::Error;

/// Messages that signal a rejected credential even when the transport did
/// not report HTTP 401.
const CREDENTIAL_MARKERS: &[&str] = &[
    "invalid_grant",
    "invalid_token",
    "invalid credentials",
    "unauthenticated",
    "autherror",
];

/// Top-level error type for storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration (usually credentials) is missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote rejected the current credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Credential refresh failed; the user has to grant access again.
    #[error("Authentication failed ({reason}); re-authorize at {url}")]
    ReauthorizationRequired {
        /// Why the refresh failed.
        reason: String,
        /// Fresh authorization URL to visit.
        url: String,
    },

    /// Remote request failed for a non-authentication reason.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The remote refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error means the access token was rejected.
    ///
    /// Covers the explicit `Authentication` variant as well as remote
    /// errors whose message carries a credential failure marker.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Authentication(_) => true,
            Error::Network(msg) | Error::PermissionDenied(msg) => {
                let msg = msg.to_ascii_lowercase();
                CREDENTIAL_MARKERS.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }

    /// Whether this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_variants() {
        assert!(Error::Authentication("401".to_string()).is_auth_failure());
        assert!(Error::Network("API error: 400 - invalid_grant".to_string()).is_auth_failure());
        assert!(Error::PermissionDenied("Invalid Credentials".to_string()).is_auth_failure());
        assert!(!Error::Network("API error: 503".to_string()).is_auth_failure());
        assert!(!Error::NotFound("x".to_string()).is_auth_failure());
    }

    #[test]
    fn test_reauthorization_message_contains_url() {
        let err = Error::ReauthorizationRequired {
            reason: "invalid_grant".to_string(),
            url: "https://accounts.example/auth?x=1".to_string(),
        };
        assert!(err.to_string().contains("https://accounts.example/auth?x=1"));
    }

    #[test]
    fn test_io_not_found() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());
    }
}
