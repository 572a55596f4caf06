//! Journal operations and commit entries.

use crate::blob::BlobId;
use crate::file::{FileAttributes, FileMetadata};
use crate::patch::{AttributesPatch, Basis};
use serde::{Deserialize, Serialize};

/// Destination of a move or copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Basis::is_overwrite")]
    pub basis: Basis,
}

impl DestRef {
    pub fn new(path: impl Into<String>, basis: Basis) -> Self {
        Self {
            path: path.into(),
            basis,
        }
    }
}

/// One operation in a transaction journal.
///
/// `source` is the caller's last-read view of the file. Only its `path` and
/// `blob_id` are checked; the remaining fields are carried for the caller's
/// benefit and not re-validated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Op {
    Move {
        source: FileMetadata,
        dest: DestRef,
    },
    Copy {
        source: FileMetadata,
        dest: DestRef,
    },
    Delete {
        source: FileMetadata,
    },
    SetAttributes {
        source: FileMetadata,
        attributes: AttributesPatch,
    },
}

impl Op {
    pub fn source(&self) -> &FileMetadata {
        match self {
            Self::Move { source, .. }
            | Self::Copy { source, .. }
            | Self::Delete { source }
            | Self::SetAttributes { source, .. } => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Copy { .. } => "copy",
            Self::Delete { .. } => "delete",
            Self::SetAttributes { .. } => "setAttributes",
        }
    }
}

/// Binds one pending upload to a path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    pub path: String,
    pub blob_id: BlobId,
    #[serde(default, skip_serializing_if = "Basis::is_overwrite")]
    pub basis: Basis,
    /// Replaces the file's attributes wholesale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<FileAttributes>,
}

impl CommitEntry {
    pub fn new(path: impl Into<String>, blob_id: BlobId) -> Self {
        Self {
            path: path.into(),
            blob_id,
            basis: Basis::Overwrite,
            attributes: None,
        }
    }

    pub fn with_basis(mut self, basis: Basis) -> Self {
        self.basis = basis;
        self
    }

    pub fn with_attributes(mut self, attributes: FileAttributes) -> Self {
        self.attributes = attributes.non_empty();
        self
    }
}
