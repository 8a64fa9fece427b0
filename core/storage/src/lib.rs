//! Dual-backend file storage for Lexideck.
//!
//! A local on-disk mirror and a remote Google Drive are exposed through one
//! facade. Logical paths are resolved into remote folder IDs, synchronous
//! operations are served locally and replicated in the background, and
//! OAuth2 tokens are refreshed transparently when the remote rejects them.
//!
//! # Design Principles
//! - Local durability first: synchronous calls never wait on the network
//! - One refresh, one retry: authentication failures are recovered once
//! - Presence-based reconciliation: whichever side has a file wins
//! - Backend isolation: the remote sits behind the [`DriveApi`] trait

pub mod config;
pub mod credentials;
pub mod facade;
pub mod gdrive;
pub mod local;
pub mod memory;
pub mod reconcile;
pub mod remote;
pub mod resolver;
pub mod retry;

pub use config::StorageConfig;
pub use credentials::{Credential, CredentialState, CredentialStore, TokenRefresher, Tokens};
pub use facade::{
    Encoding, HealthReport, ShadowOp, ShadowWriteObserver, StorageFacade, TracingObserver,
    WriteOptions,
};
pub use local::LocalMirror;
pub use memory::MemoryDrive;
pub use reconcile::{Reconciler, WriteOutcome};
pub use remote::{ByteStream, DriveApi, DriveFile, FileQuery};
pub use resolver::FolderResolver;
pub use retry::RetryingClient;
