//! Asset reconciliation sensor.
//!
//! The sensor packages the engine for periodic evaluation:
//!
//! ```text
//! previous cursor ──► decode ──► upstream map ──► reconcile ──► merge ──► encode
//!                                                     │
//!                                                     └──► run requests
//! ```
//!
//! Each tick builds a fresh [`CachingInstanceQueryer`] over the store, so no
//! cached fact survives from one tick to the next. A tick that fails returns
//! the error and leaves the caller's cursor untouched.
//!
//! ## Example
//!
//! ```rust
//! use tidemark_core::AssetKey;
//! use tidemark_flow::graph::{AssetDefinition, AssetGraph, AssetSelection};
//! use tidemark_flow::sensor::build_asset_reconciliation_sensor;
//! use tidemark_flow::store::memory::InMemoryFactStore;
//!
//! let raw = AssetKey::parse("raw").unwrap();
//! let clean = AssetKey::parse("clean").unwrap();
//! let graph = AssetGraph::from_parts(
//!     [
//!         AssetDefinition::new(raw.clone(), []),
//!         AssetDefinition::new(clean.clone(), [raw.clone()]),
//!     ],
//!     [],
//! )
//! .unwrap();
//!
//! let selection = AssetSelection::keys([clean.clone()]);
//! let sensor = build_asset_reconciliation_sensor(selection, "clean_sensor")
//!     .build()
//!     .unwrap();
//!
//! let store = InMemoryFactStore::new();
//! store.materialize([raw]).unwrap();
//!
//! let tick = sensor.evaluate_tick(&graph, &store, None).unwrap();
//! assert_eq!(tick.run_requests.len(), 1);
//! assert!(tick.run_requests[0].asset_keys.contains(&clean));
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::observability::reconciliation_span;

use crate::config::SensorConfig;
use crate::cursor::ReconciliationCursor;
use crate::error::Result;
use crate::graph::{AssetGraph, AssetSelection};
use crate::metrics::{time_reconcile_tick, ReconcileMetrics, TickStatus};
use crate::queryer::{CacheStats, CachingInstanceQueryer};
use crate::reconcile::{reconcile, AssetEvaluation, ReconciliationOptions, RunRequest};
use crate::store::FactStore;

/// Minimum seconds between evaluations when none is configured.
pub const DEFAULT_MINIMUM_INTERVAL_SECONDS: u64 = 30;

/// Longest honoured interval (about 100 years).
const MAX_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Whether a sensor is evaluated by its driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    /// Evaluated on every eligible tick.
    Running,
    /// Never evaluated.
    #[default]
    Stopped,
}

/// Output of one sensor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickResult {
    /// Zero or one run request.
    pub run_requests: Vec<RunRequest>,
    /// The merged cursor to persist for the next tick.
    pub cursor: String,
    /// Per-asset explanations.
    pub evaluations: Vec<AssetEvaluation>,
    /// Queryer cache statistics for the tick.
    pub cache_stats: CacheStats,
}

/// Persisted evaluation state of a sensor between ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    /// Current status.
    pub status: SensorStatus,
    /// Cursor produced by the last successful tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Time of the last evaluation, successful or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_at: Option<DateTime<Utc>>,
}

/// A validated reconciliation sensor definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReconciliationSensor {
    config: SensorConfig,
}

impl AssetReconciliationSensor {
    /// Creates a sensor from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SensorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The sensor configuration.
    #[must_use]
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// The sensor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The monitored selection.
    #[must_use]
    pub fn selection(&self) -> &AssetSelection {
        &self.config.selection
    }

    /// Engine policy switches.
    #[must_use]
    pub fn options(&self) -> ReconciliationOptions {
        self.config.options()
    }

    /// Description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.config.description.as_deref()
    }

    /// Status a new sensor starts in.
    #[must_use]
    pub fn default_status(&self) -> SensorStatus {
        self.config.default_status
    }

    /// Tags attached to every run request.
    #[must_use]
    pub fn run_tags(&self) -> &BTreeMap<String, String> {
        &self.config.run_tags
    }

    /// Minimum time between evaluations.
    #[must_use]
    pub fn minimum_interval(&self) -> Duration {
        let seconds = self
            .config
            .minimum_interval_seconds
            .unwrap_or(DEFAULT_MINIMUM_INTERVAL_SECONDS);
        let seconds = i64::try_from(seconds.min(MAX_INTERVAL_SECONDS)).unwrap_or(i64::MAX / 1_000);
        Duration::seconds(seconds)
    }

    /// Initial state for a newly deployed sensor.
    #[must_use]
    pub fn initial_state(&self) -> SensorState {
        SensorState {
            status: self.config.default_status,
            cursor: None,
            last_evaluation_at: None,
        }
    }

    /// Checks whether the sensor is due for evaluation.
    #[must_use]
    pub fn should_evaluate(
        &self,
        status: SensorStatus,
        last_evaluation_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if status == SensorStatus::Stopped {
            return false;
        }

        if let Some(last_eval) = last_evaluation_at {
            if now - last_eval < self.minimum_interval() {
                return false;
            }
        }

        true
    }

    /// Evaluates one tick against `previous_cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be decoded, the selection does
    /// not resolve, the upstream map is cyclic, or a store query fails.
    pub fn evaluate_tick(
        &self,
        graph: &AssetGraph,
        store: &dyn FactStore,
        previous_cursor: Option<&str>,
    ) -> Result<TickResult> {
        let tick_id = ulid::Ulid::new().to_string();
        let span = reconciliation_span(&self.config.name, &tick_id);
        let _entered = span.enter();
        let _timer = time_reconcile_tick();
        let metrics = ReconcileMetrics::new();

        let result = self.evaluate(graph, store, previous_cursor, metrics);
        match &result {
            Ok(tick) if tick.run_requests.is_empty() => metrics.record_tick(TickStatus::NoNewData),
            Ok(_) => metrics.record_tick(TickStatus::Triggered),
            Err(e) => {
                tracing::warn!(error = %e, "reconciliation tick failed");
                metrics.record_tick(TickStatus::Error);
            }
        }
        result
    }

    /// Evaluates a tick if due, updating `state` in place.
    ///
    /// Returns `Ok(None)` when the tick was skipped. The cursor in `state` only
    /// changes when evaluation succeeds.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::evaluate_tick`] errors.
    pub fn tick(
        &self,
        state: &mut SensorState,
        graph: &AssetGraph,
        store: &dyn FactStore,
        now: DateTime<Utc>,
    ) -> Result<Option<TickResult>> {
        if !self.should_evaluate(state.status, state.last_evaluation_at, now) {
            tracing::debug!(sensor = %self.config.name, "tick skipped");
            ReconcileMetrics::new().record_tick(TickStatus::Skipped);
            return Ok(None);
        }

        state.last_evaluation_at = Some(now);
        let result = self.evaluate_tick(graph, store, state.cursor.as_deref())?;
        state.cursor = Some(result.cursor.clone());
        Ok(Some(result))
    }

    fn evaluate(
        &self,
        graph: &AssetGraph,
        store: &dyn FactStore,
        previous_cursor: Option<&str>,
        metrics: ReconcileMetrics,
    ) -> Result<TickResult> {
        let mut cursor = ReconciliationCursor::decode(previous_cursor)?;
        let upstream = graph.upstream_mapping(&self.config.selection)?;
        metrics.set_monitored_assets(upstream.len());

        let mut queryer = CachingInstanceQueryer::new(store);
        let outcome = reconcile(
            &upstream,
            &mut queryer,
            &cursor,
            self.options(),
            &self.config.run_tags,
        )?;

        cursor.merge(&outcome.cursor_updates);
        let encoded = cursor.encode()?;

        for request in &outcome.run_requests {
            metrics.record_run_request(request.asset_keys.len());
        }

        let stats = queryer.stats().clone();
        tracing::info!(
            monitored = upstream.len(),
            requested = outcome.selected().len(),
            cursor_updates = outcome.cursor_updates.len(),
            cache_hits = stats.total_hits(),
            cache_misses = stats.total_misses(),
            "reconciliation tick evaluated"
        );

        Ok(TickResult {
            run_requests: outcome.run_requests,
            cursor: encoded,
            evaluations: outcome.evaluations,
            cache_stats: stats,
        })
    }
}

/// Starts building a reconciliation sensor with the standard defaults:
/// any-upstream mode, waiting for in-progress runs, stopped.
#[must_use]
pub fn build_asset_reconciliation_sensor(
    selection: AssetSelection,
    name: impl Into<String>,
) -> SensorBuilder {
    SensorBuilder {
        config: SensorConfig {
            name: name.into(),
            selection,
            ..SensorConfig::default()
        },
    }
}

/// Builder returned by [`build_asset_reconciliation_sensor`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SensorBuilder {
    config: SensorConfig,
}

impl SensorBuilder {
    /// Requires all parents to be updated.
    pub fn wait_for_all_upstream(mut self, wait: bool) -> Self {
        self.config.wait_for_all_upstream = wait;
        self
    }

    /// Defers assets whose parents are still being produced.
    pub fn wait_for_in_progress_runs(mut self, wait: bool) -> Self {
        self.config.wait_for_in_progress_runs = wait;
        self
    }

    /// Sets the minimum seconds between evaluations.
    pub fn minimum_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.minimum_interval_seconds = Some(seconds);
        self
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    /// Sets the initial status.
    pub fn default_status(mut self, status: SensorStatus) -> Self {
        self.config.default_status = status;
        self
    }

    /// Adds a run tag.
    pub fn run_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.run_tags.insert(key.into(), value.into());
        self
    }

    /// Validates and builds the sensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or interval is invalid.
    pub fn build(self) -> Result<AssetReconciliationSensor> {
        AssetReconciliationSensor::new(self.config)
    }
}
