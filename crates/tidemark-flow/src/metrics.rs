//! Observability metrics for reconciliation.
//!
//! Metrics go through the `metrics` crate facade; installing a recorder
//! (Prometheus or otherwise) is left to the embedding binary.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tidemark_reconcile_ticks_total` | Counter | `status` | Tick outcomes |
//! | `tidemark_reconcile_tick_duration_seconds` | Histogram | - | Tick evaluation time |
//! | `tidemark_run_requests_total` | Counter | `source` | Run requests emitted |
//! | `tidemark_assets_requested_total` | Counter | - | Assets included in run requests |
//! | `tidemark_queryer_cache_total` | Counter | `query`, `result` | Queryer cache hits and misses |
//! | `tidemark_monitored_assets` | Gauge | - | Assets monitored by the last tick |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tidemark_flow::metrics::{ReconcileMetrics, TickStatus};
//!
//! let metrics = ReconcileMetrics::new();
//! metrics.record_tick(TickStatus::Triggered);
//! metrics.record_run_request(3);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reconciliation ticks by outcome.
    pub const RECONCILE_TICKS_TOTAL: &str = "tidemark_reconcile_ticks_total";
    /// Histogram: Tick evaluation time in seconds.
    pub const RECONCILE_TICK_DURATION_SECONDS: &str = "tidemark_reconcile_tick_duration_seconds";
    /// Counter: Run requests by source.
    pub const RUN_REQUESTS_TOTAL: &str = "tidemark_run_requests_total";
    /// Counter: Assets included in emitted run requests.
    pub const ASSETS_REQUESTED_TOTAL: &str = "tidemark_assets_requested_total";
    /// Counter: Queryer cache lookups by query kind and result.
    pub const QUERYER_CACHE_TOTAL: &str = "tidemark_queryer_cache_total";
    /// Gauge: Number of assets monitored by the most recent tick.
    pub const MONITORED_ASSETS: &str = "tidemark_monitored_assets";
}

/// Label keys used across metrics.
pub mod labels {
    /// Tick outcome (triggered, `no_new_data`, error, skipped).
    pub const STATUS: &str = "status";
    /// Trigger source.
    pub const SOURCE: &str = "source";
    /// Queryer query kind.
    pub const QUERY: &str = "query";
    /// Cache lookup result (hit, miss).
    pub const RESULT: &str = "result";
}

/// Run-request source label used by the reconciliation sensor.
pub const SOURCE_RECONCILIATION: &str = "asset_reconciliation";

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// At least one run request was emitted.
    Triggered,
    /// Evaluation completed with nothing to materialize.
    NoNewData,
    /// Evaluation failed.
    Error,
    /// The tick was gated by the minimum interval or sensor status.
    Skipped,
}

impl TickStatus {
    /// Returns the label value for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::NoNewData => "no_new_data",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// High-level interface for recording reconciliation metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileMetrics;

impl ReconcileMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a tick outcome.
    pub fn record_tick(&self, status: TickStatus) {
        counter!(
            names::RECONCILE_TICKS_TOTAL,
            labels::STATUS => status.as_str(),
        )
        .increment(1);
    }

    /// Records tick evaluation time.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::RECONCILE_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records one emitted run request covering `asset_count` assets.
    pub fn record_run_request(&self, asset_count: usize) {
        counter!(
            names::RUN_REQUESTS_TOTAL,
            labels::SOURCE => SOURCE_RECONCILIATION,
        )
        .increment(1);
        counter!(names::ASSETS_REQUESTED_TOTAL).increment(asset_count as u64);
    }

    /// Records a queryer cache lookup.
    pub fn record_cache_lookup(&self, query: &'static str, hit: bool) {
        counter!(
            names::QUERYER_CACHE_TOTAL,
            labels::QUERY => query,
            labels::RESULT => if hit { "hit" } else { "miss" },
        )
        .increment(1);
    }

    /// Sets the number of monitored assets.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_monitored_assets(&self, count: usize) {
        gauge!(names::MONITORED_ASSETS).set(count as f64);
    }
}

/// RAII guard that reports elapsed time when dropped.
///
/// ## Example
///
/// ```rust
/// use tidemark_flow::metrics::TimingGuard;
///
/// let mut observed = None;
/// {
///     let _guard = TimingGuard::new(|duration| observed = Some(duration));
/// }
/// assert!(observed.is_some());
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for reconciliation tick duration.
#[must_use]
pub fn time_reconcile_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| ReconcileMetrics::new().observe_tick_duration(duration))
}
