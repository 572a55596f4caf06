//! Path listing pagination.

use crate::file::FileMetadata;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Closes a prefix range. Paths compare bytewise as UTF-8 and this sorts
/// above every other code point.
pub const PREFIX_RANGE_END: char = char::MAX;

/// Exclusive upper bound of the half-open range `[prefix, prefix + U+10FFFF)`.
pub fn prefix_upper_bound(prefix: &str) -> String {
    let mut end = String::with_capacity(prefix.len() + PREFIX_RANGE_END.len_utf8());
    end.push_str(prefix);
    end.push(PREFIX_RANGE_END);
    end
}

/// Opaque position in a path listing: the last path already returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListCursor {
    after: String,
}

impl ListCursor {
    /// Cursor positioned before every path.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn after(path: impl Into<String>) -> Self {
        Self { after: path.into() }
    }

    /// Last path returned, or `None` at the start.
    pub fn last_path(&self) -> Option<&str> {
        if self.after.is_empty() {
            None
        } else {
            Some(&self.after)
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.after.as_bytes())
    }

    pub fn decode(s: &str) -> crate::Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| crate::Error::InvalidCursor(format!("invalid cursor encoding: {e}")))?;
        let after = String::from_utf8(bytes)
            .map_err(|e| crate::Error::InvalidCursor(format!("cursor is not UTF-8: {e}")))?;
        Ok(Self { after })
    }
}

impl Serialize for ListCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ListCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Pagination request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageOpts {
    pub num_items: u32,
    #[serde(default)]
    pub cursor: Option<ListCursor>,
}

impl PageOpts {
    pub fn first(num_items: u32) -> Self {
        Self {
            num_items,
            cursor: None,
        }
    }

    pub fn next(num_items: u32, cursor: ListCursor) -> Self {
        Self {
            num_items,
            cursor: Some(cursor),
        }
    }

    /// Page size clamped to `[1, MAX_PAGE_SIZE]`.
    pub fn normalized_num_items(&self) -> u32 {
        self.num_items.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for PageOpts {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// One page of a path listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    pub page: Vec<FileMetadata>,
    pub continue_cursor: ListCursor,
    pub is_done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_bound_appends_max_char() {
        let end = prefix_upper_bound("/uploads/");
        assert_eq!(end, "/uploads/\u{10FFFF}");
        assert!("/uploads/z" < end.as_str());
        assert!("/uploads/\u{FFFF}" < end.as_str());
        assert!("/uploads/\u{1F600}.png" < end.as_str());
        assert!("/uploads/\u{20000}" < end.as_str());
        assert!("/uploads0" > end.as_str());
    }

    #[test]
    fn cursor_encoding() {
        let cursor = ListCursor::after("/a/b");
        let decoded = ListCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.last_path(), Some("/a/b"));
        assert_eq!(ListCursor::start().last_path(), None);
        assert!(ListCursor::decode("!!!").is_err());
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(PageOpts::first(0).normalized_num_items(), 1);
        assert_eq!(PageOpts::first(5000).normalized_num_items(), MAX_PAGE_SIZE);
    }
}
