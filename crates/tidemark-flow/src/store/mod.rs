//! Fact-store contract consumed by the reconciliation engine.
//!
//! The fact store is an append-only log of asset events. The engine only ever
//! reads from it; all queries are bounded by a storage id so facts appended by
//! concurrently running jobs are either fully visible or not visible at all.
//!
//! ## Design Principles
//!
//! - **Read-only**: the engine never writes facts
//! - **Monotone**: storage ids are assigned in strictly increasing append order
//! - **Testability**: [`memory::InMemoryFactStore`] implements the contract for
//!   tests and local tooling; durable stores live outside this crate

pub mod memory;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::{AssetKey, RunId, StorageId};

use crate::error::Result;

/// A completed write of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationRecord {
    /// The materialized asset.
    pub asset_key: AssetKey,
    /// Position in the fact store.
    pub storage_id: StorageId,
    /// Run that produced the materialization, absent for runless reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Wall-clock time of the event (advisory only).
    pub timestamp: DateTime<Utc>,
}

/// An in-flight intent to materialize an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMaterializationRecord {
    /// The asset the run plans to materialize.
    pub asset_key: AssetKey,
    /// The planning run.
    pub run_id: RunId,
    /// Position in the fact store.
    pub storage_id: StorageId,
}

/// Lifecycle status of a run, as reported by the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting in the run queue.
    Queued,
    /// Created but not yet launched.
    NotStarted,
    /// Launched, waiting for the process to come up.
    Starting,
    /// Executing.
    Started,
    /// Cancellation requested, still executing.
    Canceling,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failure,
    /// Cancelled.
    Canceled,
}

impl RunStatus {
    /// Returns true while the run may still append facts.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::NotStarted | Self::Starting | Self::Started | Self::Canceling
        )
    }
}

/// Query contract over the append-only fact store.
///
/// Implementations must return the record with the highest storage id for
/// "latest" queries, and must treat `after: None` as "no lower bound".
///
/// ## Thread Safety
///
/// Stores are `Send + Sync`; facts may be appended by other threads between
/// (and during) ticks.
pub trait FactStore: Send + Sync {
    /// Returns the latest materialization of `asset_key` with storage id
    /// strictly greater than `after`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] if the query fails.
    fn latest_materialization(
        &self,
        asset_key: &AssetKey,
        after: Option<StorageId>,
    ) -> Result<Option<MaterializationRecord>>;

    /// Returns the latest planned materialization of `asset_key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] if the query fails.
    fn latest_planned_materialization(
        &self,
        asset_key: &AssetKey,
    ) -> Result<Option<PlannedMaterializationRecord>>;

    /// Returns every asset the run planned to materialize.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] if the query fails.
    fn planned_assets_for_run(&self, run_id: &RunId) -> Result<BTreeSet<AssetKey>>;

    /// Returns true if the run exists and is still in progress.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] if the query fails.
    fn is_run_in_progress(&self, run_id: &RunId) -> Result<bool>;
}
