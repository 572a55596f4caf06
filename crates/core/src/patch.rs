//! Three-state update semantics.
//!
//! Wire formats distinguish an omitted field from an explicit `null`. Both
//! [`Patch`] and [`Basis`] keep the distinction explicit in the type so that
//! "keep" and "clear" cannot be conflated.

use crate::blob::BlobId;
use crate::file::FileAttributes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// Per-field update: omitted keeps, `null` clears, a value sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    /// Merge into the current value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Clear => None,
            Self::Set(value) => Some(value),
        }
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(value) => serializer.serialize_some(value),
            Self::Keep | Self::Clear => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only reached when the field is present; absence maps to `Keep` via
        // `#[serde(default)]` on the containing struct.
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Self::Set(value),
            None => Self::Clear,
        })
    }
}

mod rfc3339_patch {
    use super::Patch;
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        patch: &Patch<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match patch {
            Patch::Set(at) => time::serde::rfc3339::option::serialize(&Some(*at), serializer),
            Patch::Keep | Patch::Clear => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Patch<OffsetDateTime>, D::Error> {
        Ok(match time::serde::rfc3339::option::deserialize(deserializer)? {
            Some(at) => Patch::Set(at),
            None => Patch::Clear,
        })
    }
}

/// Attribute merge input for `setAttributes`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesPatch {
    #[serde(default, with = "rfc3339_patch", skip_serializing_if = "Patch::is_keep")]
    pub expires_at: Patch<OffsetDateTime>,
}

impl AttributesPatch {
    /// Three-way merge against the stored attributes.
    pub fn apply(self, current: Option<FileAttributes>) -> Option<FileAttributes> {
        let current = current.unwrap_or_default();
        FileAttributes {
            expires_at: self.expires_at.apply(current.expires_at),
        }
        .non_empty()
    }
}

/// Optimistic-concurrency precondition on a destination path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Basis {
    /// Field omitted: overwrite whatever is there, or create.
    #[default]
    Overwrite,
    /// Explicit `null`: the destination must not exist.
    MustNotExist,
    /// The destination must exist and point at this blob.
    MustMatch(BlobId),
}

/// How a destination failed its [`Basis`] check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasisViolation {
    Exists,
    NotFound,
    Changed,
}

impl Basis {
    pub fn is_overwrite(&self) -> bool {
        matches!(self, Self::Overwrite)
    }

    /// The blob the caller expects to find, for error payloads.
    pub fn expected(&self) -> Option<&BlobId> {
        match self {
            Self::MustMatch(id) => Some(id),
            Self::Overwrite | Self::MustNotExist => None,
        }
    }

    /// Check the blob currently at the destination against this basis.
    pub fn check(&self, found: Option<&BlobId>) -> Result<(), BasisViolation> {
        match (self, found) {
            (Self::Overwrite, _) => Ok(()),
            (Self::MustNotExist, None) => Ok(()),
            (Self::MustNotExist, Some(_)) => Err(BasisViolation::Exists),
            (Self::MustMatch(_), None) => Err(BasisViolation::NotFound),
            (Self::MustMatch(expected), Some(found)) if expected == found => Ok(()),
            (Self::MustMatch(_), Some(_)) => Err(BasisViolation::Changed),
        }
    }
}

impl Serialize for Basis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::MustMatch(id) => serializer.serialize_some(id),
            Self::Overwrite | Self::MustNotExist => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Basis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<BlobId>::deserialize(deserializer)? {
            Some(id) => Self::MustMatch(id),
            None => Self::MustNotExist,
        })
    }
}
