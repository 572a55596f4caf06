//! Core domain types for the stash virtual filesystem.
//!
//! This crate defines the data model shared by every other crate:
//! - Blob identifiers and file metadata
//! - Three-state patch and basis semantics for attribute merges and CAS
//! - Journal operations and commit entries
//! - Conflict codes and error payloads
//! - Path listing pagination
//! - Configuration types

pub mod blob;
pub mod config;
pub mod conflict;
pub mod error;
pub mod file;
pub mod op;
pub mod page;
pub mod patch;

pub use blob::BlobId;
pub use conflict::{ConflictCode, ConflictError};
pub use error::{Error, Result};
pub use file::{FileAttributes, FileMetadata, validate_path};
pub use op::{CommitEntry, DestRef, Op};
pub use page::{FilePage, ListCursor, PageOpts, prefix_upper_bound};
pub use patch::{AttributesPatch, Basis, Patch};

/// Content type recorded when a backend does not report one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
