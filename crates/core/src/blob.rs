//! Blob identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one physical object in the blob store.
///
/// Identifiers are assigned fresh for every upload and never reused. They are
/// not content hashes: two uploads of identical bytes get distinct ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    /// Generate a new random blob ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse from a string.
    ///
    /// Any non-empty string without path separators is accepted, since ids
    /// issued by earlier versions need not be UUIDs.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() {
            return Err(crate::Error::InvalidBlobId("empty blob id".to_string()));
        }
        if s.contains('/') || s.contains('\\') || s.contains("..") {
            return Err(crate::Error::InvalidBlobId(format!(
                "blob id contains path characters: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
