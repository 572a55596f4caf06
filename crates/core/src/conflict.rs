//! Optimistic-concurrency conflicts.

use crate::blob::BlobId;
use crate::patch::BasisViolation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable conflict code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictCode {
    SourceNotFound,
    SourceChanged,
    DestExists,
    DestNotFound,
    DestChanged,
    CasConflict,
}

impl ConflictCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceNotFound => "SOURCE_NOT_FOUND",
            Self::SourceChanged => "SOURCE_CHANGED",
            Self::DestExists => "DEST_EXISTS",
            Self::DestNotFound => "DEST_NOT_FOUND",
            Self::DestChanged => "DEST_CHANGED",
            Self::CasConflict => "CAS_CONFLICT",
        }
    }

    /// Destination code for a failed move/copy basis.
    pub fn for_dest(violation: BasisViolation) -> Self {
        match violation {
            BasisViolation::Exists => Self::DestExists,
            BasisViolation::NotFound => Self::DestNotFound,
            BasisViolation::Changed => Self::DestChanged,
        }
    }
}

impl fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict payload returned to callers.
///
/// `expected` and `found` are always present on the wire; `null` means "no
/// file" on that side of the comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "conflict", rename_all = "camelCase")]
pub struct ConflictError {
    pub code: ConflictCode,
    pub message: String,
    pub path: String,
    pub expected: Option<BlobId>,
    pub found: Option<BlobId>,
    /// 1-indexed position of the failing operation in a journal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_index: Option<usize>,
}

fn describe(id: Option<&BlobId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "none".to_string(),
    }
}

impl ConflictError {
    pub fn new(
        code: ConflictCode,
        path: impl Into<String>,
        expected: Option<BlobId>,
        found: Option<BlobId>,
    ) -> Self {
        let path = path.into();
        let message = match code {
            ConflictCode::SourceNotFound => format!("source file not found: {path}"),
            ConflictCode::SourceChanged => format!(
                "source file {path} changed: expected blob {}, found {}",
                describe(expected.as_ref()),
                describe(found.as_ref())
            ),
            ConflictCode::DestExists => format!(
                "destination {path} already exists (blob {})",
                describe(found.as_ref())
            ),
            ConflictCode::DestNotFound => format!(
                "destination {path} not found (expected blob {})",
                describe(expected.as_ref())
            ),
            ConflictCode::DestChanged => format!(
                "destination {path} changed: expected blob {}, found {}",
                describe(expected.as_ref()),
                describe(found.as_ref())
            ),
            ConflictCode::CasConflict => format!(
                "compare-and-swap failed for {path}: expected {}, found {}",
                describe(expected.as_ref()),
                describe(found.as_ref())
            ),
        };
        Self {
            code,
            message,
            path,
            expected,
            found,
            operation_index: None,
        }
    }

    /// Tag the conflict with the 1-indexed journal position.
    pub fn at_operation(mut self, index: usize) -> Self {
        self.message = format!("operation {index}: {}", self.message);
        self.operation_index = Some(index);
        self
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConflictError {}
