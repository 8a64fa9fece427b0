//! Common utilities and types shared across Lexideck storage crates.
//!
//! This crate provides the error taxonomy and the logical path type that
//! both the local and the remote backends agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{normalize, ContainerId, FileId, LogicalPath};
