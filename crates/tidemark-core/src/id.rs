//! Strongly-typed identifiers for runs and fact-store events.
//!
//! - [`RunId`] is a ULID: globally unique and sortable by creation time.
//! - [`StorageId`] is assigned by the fact store at append time. It is the
//!   only ordering primitive the reconciliation engine trusts; timestamps are
//!   advisory.
//!
//! # Example
//!
//! ```rust
//! use tidemark_core::id::{RunId, StorageId};
//!
//! let run = RunId::generate();
//! let parsed: RunId = run.to_string().parse().unwrap();
//! assert_eq!(run, parsed);
//!
//! assert!(StorageId::new(2) > StorageId::new(1));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a run launched by the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generates a new unique run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a run ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid run ID '{s}': {e}"),
            })
    }
}

/// Position of an event in the append-only fact store.
///
/// Stores assign storage ids starting at 1 in strictly increasing append
/// order, so `StorageId::ZERO` sorts before every stored event and "after
/// `ZERO`" means "no lower bound".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StorageId(u64);

impl StorageId {
    /// Sorts before every stored event.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw storage id.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the id that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for StorageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
