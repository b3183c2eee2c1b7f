//! Persisted reconciliation cursor.
//!
//! The cursor maps each monitored asset to the highest parent storage id it
//! has already consumed. It is stored between ticks as a JSON string:
//!
//! ```json
//! {"version":1,"consumed":{"warehouse/orders":12}}
//! ```
//!
//! The unversioned flat form (`{"warehouse/orders":12}`) written by earlier
//! deployments is still accepted on read; encoding always writes the
//! versioned envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tidemark_core::{AssetKey, StorageId};

use crate::error::{Error, Result};

/// Current cursor envelope version.
pub const CURSOR_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    consumed: BTreeMap<AssetKey, StorageId>,
}

/// Decoded per-asset watermark map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationCursor {
    consumed: BTreeMap<AssetKey, StorageId>,
}

impl ReconciliationCursor {
    /// Creates an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a persisted cursor. Absent or blank input yields an empty cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorDecode`] if the input is not a valid cursor and
    /// [`Error::UnsupportedCursorVersion`] if it carries an unknown version.
    pub fn decode(input: Option<&str>) -> Result<Self> {
        let Some(raw) = input.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(Self::default());
        };

        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::cursor_decode(e.to_string()))?;
        let Value::Object(object) = &value else {
            return Err(Error::cursor_decode("cursor must be a JSON object"));
        };

        let consumed = if object.contains_key("version") && object.contains_key("consumed") {
            let version = object
                .get("version")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::cursor_decode("cursor version must be an integer"))?;
            if version != CURSOR_VERSION {
                return Err(Error::UnsupportedCursorVersion {
                    version,
                    supported: CURSOR_VERSION,
                });
            }
            let envelope: Envelope =
                serde_json::from_value(value).map_err(|e| Error::cursor_decode(e.to_string()))?;
            envelope.consumed
        } else {
            serde_json::from_value(value).map_err(|e| Error::cursor_decode(e.to_string()))?
        };

        Ok(Self { consumed })
    }

    /// Encodes the cursor in the current envelope format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&Envelope {
            version: CURSOR_VERSION,
            consumed: self.consumed.clone(),
        })
        .map_err(|e| Error::Serialization {
            message: e.to_string(),
        })
    }

    /// Returns the consumed storage id for an asset.
    #[must_use]
    pub fn get(&self, asset_key: &AssetKey) -> Option<StorageId> {
        self.consumed.get(asset_key).copied()
    }

    /// Sets the consumed storage id for an asset.
    pub fn insert(&mut self, asset_key: AssetKey, storage_id: StorageId) {
        self.consumed.insert(asset_key, storage_id);
    }

    /// Merges newly consumed entries; new values win per key.
    pub fn merge(&mut self, updates: &BTreeMap<AssetKey, StorageId>) {
        for (asset_key, storage_id) in updates {
            self.consumed.insert(asset_key.clone(), *storage_id);
        }
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&AssetKey, StorageId)> {
        self.consumed.iter().map(|(k, v)| (k, *v))
    }

    /// Number of assets with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    /// Returns true if no asset has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }
}

impl FromIterator<(AssetKey, StorageId)> for ReconciliationCursor {
    fn from_iter<I: IntoIterator<Item = (AssetKey, StorageId)>>(iter: I) -> Self {
        Self {
            consumed: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AssetKey {
        AssetKey::parse(s).unwrap()
    }

    #[test]
    fn absent_and_blank_cursors_are_empty() {
        assert!(ReconciliationCursor::decode(None).unwrap().is_empty());
        assert!(ReconciliationCursor::decode(Some("")).unwrap().is_empty());
        assert!(ReconciliationCursor::decode(Some("  \n")).unwrap().is_empty());
    }

    #[test]
    fn encodes_versioned_envelope() {
        let cursor: ReconciliationCursor =
            [(key("warehouse/orders"), StorageId::new(12))].into_iter().collect();
        assert_eq!(
            cursor.encode().unwrap(),
            r#"{"version":1,"consumed":{"warehouse/orders":12}}"#
        );
    }

    #[test]
    fn decodes_envelope_and_legacy_form() {
        let versioned =
            ReconciliationCursor::decode(Some(r#"{"version":1,"consumed":{"a/b":7}}"#)).unwrap();
        let legacy = ReconciliationCursor::decode(Some(r#"{"a/b":7}"#)).unwrap();
        assert_eq!(versioned, legacy);
        assert_eq!(legacy.get(&key("a/b")), Some(StorageId::new(7)));
    }

    #[test]
    fn legacy_asset_named_version_is_not_an_envelope() {
        let cursor = ReconciliationCursor::decode(Some(r#"{"version":3}"#)).unwrap();
        assert_eq!(cursor.get(&key("version")), Some(StorageId::new(3)));
    }

    #[test]
    fn rejects_unknown_version() {
        let err =
            ReconciliationCursor::decode(Some(r#"{"version":2,"consumed":{}}"#)).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedCursorVersion {
                version: 2,
                supported: 1
            }
        ));
    }

    #[test]
    fn rejects_malformed_input() {
        for raw in [
            "not json",
            "[1, 2]",
            r#"{"a": "seven"}"#,
            r#"{"a": -1}"#,
            r#"{"bad key": 1}"#,
            r#"{"version":"one","consumed":{}}"#,
        ] {
            let err = ReconciliationCursor::decode(Some(raw)).unwrap_err();
            assert!(matches!(err, Error::CursorDecode { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn merge_prefers_new_values() {
        let mut cursor: ReconciliationCursor = [
            (key("a"), StorageId::new(3)),
            (key("b"), StorageId::new(5)),
        ]
        .into_iter()
        .collect();
        let updates: BTreeMap<_, _> = [
            (key("b"), StorageId::new(9)),
            (key("c"), StorageId::new(1)),
        ]
        .into();
        cursor.merge(&updates);

        let entries: Vec<(String, u64)> = cursor
            .iter()
            .map(|(k, v)| (k.to_string(), v.get()))
            .collect();
        assert_eq!(
            entries,
            vec![("a".into(), 3), ("b".into(), 9), ("c".into(), 1)]
        );
    }
}
