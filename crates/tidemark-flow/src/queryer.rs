//! Per-tick caching façade over the fact store.
//!
//! A reconciliation tick asks the same questions about the same parents many
//! times (every child of a parent repeats the parent's queries). The
//! [`CachingInstanceQueryer`] memoizes the four query kinds the engine needs
//! so each distinct question reaches the store at most once per tick.
//!
//! Caches are never invalidated. The queryer borrows the store, so it cannot
//! outlive the tick that built it; facts appended mid-tick may or may not be
//! visible, and are picked up on the next tick either way.

use std::collections::{BTreeSet, HashMap};

use tidemark_core::{AssetKey, RunId, StorageId};

use crate::error::Result;
use crate::metrics::ReconcileMetrics;
use crate::store::{FactStore, MaterializationRecord, PlannedMaterializationRecord};

/// The query kinds served by the queryer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// `latest_materialization(asset, after)`.
    LatestMaterialization,
    /// `latest_planned_materialization(asset)`.
    LatestPlannedMaterialization,
    /// `run_planned_to_materialize(asset, run)`.
    RunPlannedAssets,
    /// `is_run_in_progress(run)`.
    RunInProgress,
}

impl QueryKind {
    /// Every query kind, in reporting order.
    pub const ALL: [Self; 4] = [
        Self::LatestMaterialization,
        Self::LatestPlannedMaterialization,
        Self::RunPlannedAssets,
        Self::RunInProgress,
    ];

    /// Returns the metric label for this query kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LatestMaterialization => "latest_materialization",
            Self::LatestPlannedMaterialization => "latest_planned_materialization",
            Self::RunPlannedAssets => "run_planned_assets",
            Self::RunInProgress => "run_in_progress",
        }
    }
}

/// Hit and miss counts for one query kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups forwarded to the store.
    pub misses: u64,
}

/// Cache statistics for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    counts: HashMap<QueryKind, CacheCounts>,
}

impl CacheStats {
    /// Returns the counts for a query kind.
    #[must_use]
    pub fn get(&self, kind: QueryKind) -> CacheCounts {
        self.counts.get(&kind).copied().unwrap_or_default()
    }

    /// Total number of lookups forwarded to the store.
    #[must_use]
    pub fn total_misses(&self) -> u64 {
        self.counts.values().map(|c| c.misses).sum()
    }

    /// Total number of lookups answered from cache.
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.counts.values().map(|c| c.hits).sum()
    }

    fn record(&mut self, kind: QueryKind, hit: bool) {
        let entry = self.counts.entry(kind).or_default();
        if hit {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
    }
}

/// Caching queryer scoped to a single reconciliation tick.
pub struct CachingInstanceQueryer<'a> {
    store: &'a dyn FactStore,
    /// Latest materialization observed per asset.
    latest_materialization: HashMap<AssetKey, MaterializationRecord>,
    /// Lowest `after` bound for which no materialization was found.
    no_materialization_floor: HashMap<AssetKey, StorageId>,
    latest_planned: HashMap<AssetKey, Option<PlannedMaterializationRecord>>,
    run_planned_assets: HashMap<RunId, BTreeSet<AssetKey>>,
    run_in_progress: HashMap<RunId, bool>,
    stats: CacheStats,
    metrics: ReconcileMetrics,
}

impl std::fmt::Debug for CachingInstanceQueryer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingInstanceQueryer")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'a> CachingInstanceQueryer<'a> {
    /// Creates a queryer with empty caches over `store`.
    #[must_use]
    pub fn new(store: &'a dyn FactStore) -> Self {
        Self {
            store,
            latest_materialization: HashMap::new(),
            no_materialization_floor: HashMap::new(),
            latest_planned: HashMap::new(),
            run_planned_assets: HashMap::new(),
            run_in_progress: HashMap::new(),
            stats: CacheStats::default(),
            metrics: ReconcileMetrics::new(),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &'a dyn FactStore {
        self.store
    }

    /// Returns the cache statistics gathered so far.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the latest materialization of `asset_key` with storage id
    /// strictly greater than `after`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn latest_materialization(
        &mut self,
        asset_key: &AssetKey,
        after: Option<StorageId>,
    ) -> Result<Option<MaterializationRecord>> {
        // Store ids start at 1, so "no bound" and "after 0" are the same query.
        let bound = after.unwrap_or(StorageId::ZERO);

        if let Some(record) = self.latest_materialization.get(asset_key) {
            let answer = (record.storage_id > bound).then(|| record.clone());
            self.observe(QueryKind::LatestMaterialization, true);
            return Ok(answer);
        }

        if self
            .no_materialization_floor
            .get(asset_key)
            .is_some_and(|floor| bound >= *floor)
        {
            self.observe(QueryKind::LatestMaterialization, true);
            return Ok(None);
        }

        self.observe(QueryKind::LatestMaterialization, false);
        let record = self.store.latest_materialization(asset_key, after)?;
        match &record {
            Some(record) => {
                self.latest_materialization
                    .insert(asset_key.clone(), record.clone());
            }
            None => {
                self.no_materialization_floor
                    .entry(asset_key.clone())
                    .and_modify(|floor| *floor = (*floor).min(bound))
                    .or_insert(bound);
            }
        }
        Ok(record)
    }

    /// Returns the latest planned materialization of `asset_key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn latest_planned_materialization(
        &mut self,
        asset_key: &AssetKey,
    ) -> Result<Option<PlannedMaterializationRecord>> {
        if let Some(cached) = self.latest_planned.get(asset_key) {
            let answer = cached.clone();
            self.observe(QueryKind::LatestPlannedMaterialization, true);
            return Ok(answer);
        }

        self.observe(QueryKind::LatestPlannedMaterialization, false);
        let record = self.store.latest_planned_materialization(asset_key)?;
        self.latest_planned
            .insert(asset_key.clone(), record.clone());
        Ok(record)
    }

    /// Returns true if `run_id` planned to materialize `asset_key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn run_planned_to_materialize(
        &mut self,
        asset_key: &AssetKey,
        run_id: &RunId,
    ) -> Result<bool> {
        if let Some(planned) = self.run_planned_assets.get(run_id) {
            let answer = planned.contains(asset_key);
            self.observe(QueryKind::RunPlannedAssets, true);
            return Ok(answer);
        }

        self.observe(QueryKind::RunPlannedAssets, false);
        let planned = self.store.planned_assets_for_run(run_id)?;
        let answer = planned.contains(asset_key);
        self.run_planned_assets.insert(*run_id, planned);
        Ok(answer)
    }

    /// Returns true if the run exists and is still in progress.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn is_run_in_progress(&mut self, run_id: &RunId) -> Result<bool> {
        if let Some(&in_progress) = self.run_in_progress.get(run_id) {
            self.observe(QueryKind::RunInProgress, true);
            return Ok(in_progress);
        }

        self.observe(QueryKind::RunInProgress, false);
        let in_progress = self.store.is_run_in_progress(run_id)?;
        self.run_in_progress.insert(*run_id, in_progress);
        Ok(in_progress)
    }

    fn observe(&mut self, kind: QueryKind, hit: bool) {
        self.stats.record(kind, hit);
        self.metrics.record_cache_lookup(kind.as_str(), hit);
    }
}
