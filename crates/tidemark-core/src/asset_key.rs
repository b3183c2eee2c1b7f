//! Hierarchical asset identifiers.
//!
//! An [`AssetKey`] is a non-empty ordered sequence of path segments. Keys are
//! value types: equality and ordering follow the segment sequence, which keeps
//! every map keyed by `AssetKey` deterministic.
//!
//! The canonical string encoding joins segments with `/`. Because segments may
//! not contain `/` (or be empty), the encoding is reversible and is the form
//! persisted in reconciliation cursors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator used by the canonical string encoding.
pub const SEGMENT_SEPARATOR: char = '/';

/// Identifier of an asset in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey {
    path: Vec<String>,
}

impl AssetKey {
    /// Builds a key from its path segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAssetKey`] if the path is empty or any segment
    /// is empty or contains characters outside `[A-Za-z0-9_.-]`.
    pub fn from_path<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path: Vec<String> = segments.into_iter().map(Into::into).collect();
        let rendered = path.join("/");

        if path.is_empty() {
            return Err(Error::invalid_asset_key(rendered, "path must not be empty"));
        }
        for segment in &path {
            if let Err(reason) = validate_segment(segment) {
                return Err(Error::invalid_asset_key(rendered, reason));
            }
        }

        Ok(Self { path })
    }

    /// Parses the canonical `seg/seg/...` encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAssetKey`] if the encoding is malformed.
    pub fn parse(encoded: &str) -> Result<Self> {
        if encoded.trim() != encoded {
            return Err(Error::invalid_asset_key(
                encoded,
                "leading or trailing whitespace",
            ));
        }
        Self::from_path(encoded.split(SEGMENT_SEPARATOR))
    }

    /// Returns the path segments.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Returns the final path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.last().map_or("", String::as_str)
    }

    /// Returns a new key with `prefix` segments prepended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAssetKey`] if a prefix segment is invalid.
    pub fn with_prefix<I, S>(&self, prefix: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path: Vec<String> = prefix.into_iter().map(Into::into).collect();
        path.extend(self.path.iter().cloned());
        Self::from_path(path)
    }

    /// Returns the canonical string encoding.
    #[must_use]
    pub fn to_encoded(&self) -> String {
        self.path.join("/")
    }
}

fn validate_segment(segment: &str) -> std::result::Result<(), String> {
    if segment.is_empty() {
        return Err("path segments must not be empty".to_string());
    }
    if let Some(c) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("segment '{segment}' contains invalid character {c:?}"));
    }
    Ok(())
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_encoded())
    }
}

impl FromStr for AssetKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AssetKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AssetKey> for String {
    fn from(key: AssetKey) -> Self {
        key.to_encoded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_reversible() {
        let key = AssetKey::from_path(["raw", "events.v2", "daily-agg"]).unwrap();
        let encoded = key.to_encoded();
        assert_eq!(encoded, "raw/events.v2/daily-agg");
        assert_eq!(AssetKey::parse(&encoded).unwrap(), key);
    }

    #[test]
    fn rejects_empty_path_and_segments() {
        assert!(AssetKey::from_path(Vec::<String>::new()).is_err());
        assert!(AssetKey::parse("").is_err());
        assert!(AssetKey::parse("a//b").is_err());
        assert!(AssetKey::parse("a/").is_err());
    }

    #[test]
    fn rejects_invalid_characters_and_whitespace() {
        let err = AssetKey::parse("a/b c").unwrap_err();
        assert!(err.to_string().contains("invalid character"));
        assert!(AssetKey::parse(" a").is_err());
        assert!(AssetKey::from_path(["a/b"]).is_err());
    }

    #[test]
    fn ordering_follows_segments() {
        let a = AssetKey::parse("a").unwrap();
        let a_b = AssetKey::parse("a/b").unwrap();
        let b = AssetKey::parse("b").unwrap();
        assert!(a < a_b);
        assert!(a_b < b);
    }

    #[test]
    fn prefix_and_name() {
        let key = AssetKey::parse("orders").unwrap();
        let prefixed = key.with_prefix(["warehouse"]).unwrap();
        assert_eq!(prefixed.to_string(), "warehouse/orders");
        assert_eq!(prefixed.name(), "orders");
        assert_eq!(prefixed.path().len(), 2);
    }

    #[test]
    fn serde_uses_string_encoding() {
        let key = AssetKey::parse("a/b").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"a/b\"");
        let back: AssetKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<AssetKey>("\"a//b\"").is_err());
    }
}
