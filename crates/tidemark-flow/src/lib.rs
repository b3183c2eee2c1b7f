//! # tidemark-flow
//!
//! Asset reconciliation for the tidemark data-orchestration platform.
//!
//! On every tick the engine looks at which upstream assets have been (or are
//! about to be) materialized since it last looked, decides which monitored
//! assets are now stale, and emits a single run request to bring them up to
//! date. A persisted per-asset cursor guarantees no fact is considered twice.
//!
//! ## Core Concepts
//!
//! - **Asset graph**: defined and source assets, resolved through selections
//!   into an upstream map of monitored assets and their parents
//! - **Fact store**: append-only log of materializations and planned
//!   materializations, queried through a per-tick cache
//! - **Cursor**: highest parent storage id each asset has consumed
//! - **Freshness policy**: lateness of upstream data in minutes
//!
//! ## Guarantees
//!
//! - **Deterministic**: Same graph, facts and cursor always produce the same decisions
//! - **Idempotent**: Re-evaluating without new facts requests nothing
//! - **Monotone**: Cursor entries never move backwards
//! - **Explainable**: Every tick reports why each monitored asset was or was not selected
//!
//! ## Example
//!
//! ```rust
//! use tidemark_core::AssetKey;
//! use tidemark_flow::prelude::*;
//! use tidemark_flow::store::memory::InMemoryFactStore;
//!
//! # fn main() -> tidemark_flow::error::Result<()> {
//! let a = AssetKey::parse("a")?;
//! let b = AssetKey::parse("b")?;
//! let graph = AssetGraph::from_parts(
//!     [AssetDefinition::new(a.clone(), []), AssetDefinition::new(b.clone(), [a.clone()])],
//!     [],
//! )?;
//! let sensor = build_asset_reconciliation_sensor(AssetSelection::all(), "keep_fresh")
//!     .wait_for_all_upstream(true)
//!     .build()?;
//!
//! let store = InMemoryFactStore::new();
//! store.materialize([a])?;
//!
//! let first = sensor.evaluate_tick(&graph, &store, None)?;
//! assert_eq!(first.run_requests.len(), 1);
//!
//! // Nothing new since the last tick.
//! let second = sensor.evaluate_tick(&graph, &store, Some(&first.cursor))?;
//! assert!(second.run_requests.is_empty());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod config;
pub mod cursor;
pub mod error;
pub mod freshness;
pub mod graph;
pub mod metrics;
pub mod queryer;
pub mod reconcile;
pub mod sensor;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::SensorConfig;
    pub use crate::cursor::ReconciliationCursor;
    pub use crate::error::{Error, Result};
    pub use crate::freshness::FreshnessPolicy;
    pub use crate::graph::{AssetDefinition, AssetGraph, AssetSelection, SourceAsset, UpstreamMap};
    pub use crate::metrics::ReconcileMetrics;
    pub use crate::queryer::CachingInstanceQueryer;
    pub use crate::reconcile::{
        reconcile, AssetEvaluation, Decision, ReconciliationOptions, ReconciliationOutcome,
        RunRequest,
    };
    pub use crate::sensor::{
        build_asset_reconciliation_sensor, AssetReconciliationSensor, SensorState, SensorStatus,
        TickResult,
    };
    pub use crate::store::{FactStore, MaterializationRecord, RunStatus};
}
