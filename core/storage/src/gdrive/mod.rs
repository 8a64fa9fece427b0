//! Google Drive backend.
//!
//! - OAuth2 authorization and refresh-token exchange
//! - Drive v3 REST client implementing [`DriveApi`](crate::remote::DriveApi)

pub mod auth;
pub mod client;

pub use auth::{AuthConfig, AuthManager};
pub use client::DriveClient;
