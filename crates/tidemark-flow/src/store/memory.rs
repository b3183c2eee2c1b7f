//! In-memory fact store for tests and local tooling.
//!
//! [`InMemoryFactStore`] keeps an append-only event log plus a run status
//! table, and mirrors the run lifecycle of the execution layer closely enough
//! to drive reconciliation ticks end to end.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Linear scans**: Queries walk the log backwards; fine for test-sized logs

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::{AssetKey, RunId, StorageId};

use super::{FactStore, MaterializationRecord, PlannedMaterializationRecord, RunStatus};
use crate::error::{Error, Result};

/// Kind of event held in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A completed materialization.
    Materialization,
    /// A run announced it will materialize the asset.
    MaterializationPlanned,
}

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the log.
    pub storage_id: StorageId,
    /// Event kind.
    pub kind: EventKind,
    /// Asset the event refers to.
    pub asset_key: AssetKey,
    /// Run that emitted the event, if any.
    pub run_id: Option<RunId>,
    /// Wall-clock time of the append.
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked for each event appended on behalf of a watched run.
pub type WatchCallback = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Handle returned by [`InMemoryFactStore::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    run_id: RunId,
    id: u64,
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<EventRecord>,
    runs: HashMap<RunId, RunStatus>,
    last_storage_id: StorageId,
}

/// In-memory, thread-safe implementation of [`FactStore`].
///
/// ## Example
///
/// ```rust
/// use tidemark_core::AssetKey;
/// use tidemark_flow::store::FactStore;
/// use tidemark_flow::store::memory::InMemoryFactStore;
///
/// let store = InMemoryFactStore::new();
/// let orders = AssetKey::parse("orders").unwrap();
/// store.materialize([orders.clone()]).unwrap();
///
/// let latest = store.latest_materialization(&orders, None).unwrap();
/// assert!(latest.is_some());
/// ```
#[derive(Default)]
pub struct InMemoryFactStore {
    log: RwLock<Log>,
    watchers: RwLock<HashMap<RunId, Vec<(u64, WatchCallback)>>>,
    next_watch_id: AtomicU64,
    queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for InMemoryFactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFactStore")
            .field("queries", &self.queries.load(Ordering::Relaxed))
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // --- Run lifecycle ---

    /// Registers a run with the given status and no events.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register_run(&self, status: RunStatus) -> Result<RunId> {
        let run_id = RunId::generate();
        self.log
            .write()
            .map_err(poison_err)?
            .runs
            .insert(run_id, status);
        Ok(run_id)
    }

    /// Sets the status of a known run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or the lock is poisoned.
    pub fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        let mut log = self.log.write().map_err(poison_err)?;
        let slot = log
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::storage(format!("unknown run {run_id}")))?;
        *slot = status;
        Ok(())
    }

    /// Returns the status of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_status(&self, run_id: &RunId) -> Result<Option<RunStatus>> {
        Ok(self.log.read().map_err(poison_err)?.runs.get(run_id).copied())
    }

    /// Starts a run that plans to materialize `assets`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn launch_run(&self, assets: impl IntoIterator<Item = AssetKey>) -> Result<RunId> {
        let run_id = self.register_run(RunStatus::Started)?;
        for asset_key in assets {
            self.append(
                EventKind::MaterializationPlanned,
                asset_key,
                Some(run_id),
                Utc::now(),
            )?;
        }
        Ok(run_id)
    }

    /// Completes a run: materializes every asset it planned, in plan order,
    /// then marks it successful.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or the lock is poisoned.
    pub fn complete_run(&self, run_id: &RunId) -> Result<Vec<MaterializationRecord>> {
        self.complete_run_at(run_id, Utc::now())
    }

    /// Like [`Self::complete_run`] with an explicit materialization timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or the lock is poisoned.
    pub fn complete_run_at(
        &self,
        run_id: &RunId,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<MaterializationRecord>> {
        let planned: Vec<AssetKey> = {
            let log = self.log.read().map_err(poison_err)?;
            if !log.runs.contains_key(run_id) {
                return Err(Error::storage(format!("unknown run {run_id}")));
            }
            log.events
                .iter()
                .filter(|e| {
                    e.kind == EventKind::MaterializationPlanned && e.run_id == Some(*run_id)
                })
                .map(|e| e.asset_key.clone())
                .collect()
        };

        let mut records = Vec::with_capacity(planned.len());
        for asset_key in planned {
            records.push(self.append_materialization(asset_key, Some(*run_id), timestamp)?);
        }
        self.set_run_status(run_id, RunStatus::Success)?;
        Ok(records)
    }

    /// Marks a run as failed without materializing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or the lock is poisoned.
    pub fn fail_run(&self, run_id: &RunId) -> Result<()> {
        self.set_run_status(run_id, RunStatus::Failure)
    }

    /// Launches and completes a run in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn materialize(&self, assets: impl IntoIterator<Item = AssetKey>) -> Result<RunId> {
        let run_id = self.launch_run(assets)?;
        self.complete_run(&run_id)?;
        Ok(run_id)
    }

    // --- Raw appends ---

    /// Appends a materialization event.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn append_materialization(
        &self,
        asset_key: AssetKey,
        run_id: Option<RunId>,
        timestamp: DateTime<Utc>,
    ) -> Result<MaterializationRecord> {
        let event = self.append(EventKind::Materialization, asset_key, run_id, timestamp)?;
        Ok(MaterializationRecord {
            asset_key: event.asset_key,
            storage_id: event.storage_id,
            run_id: event.run_id,
            timestamp: event.timestamp,
        })
    }

    /// Records a materialization that happened outside any run.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn report_runless_materialization(
        &self,
        asset_key: AssetKey,
    ) -> Result<MaterializationRecord> {
        self.append_materialization(asset_key, None, Utc::now())
    }

    fn append(
        &self,
        kind: EventKind,
        asset_key: AssetKey,
        run_id: Option<RunId>,
        timestamp: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let event = {
            let mut log = self.log.write().map_err(poison_err)?;
            let storage_id = log.last_storage_id.next();
            log.last_storage_id = storage_id;
            let event = EventRecord {
                storage_id,
                kind,
                asset_key,
                run_id,
                timestamp,
            };
            log.events.push(event.clone());
            event
        };

        if let Some(run_id) = event.run_id {
            self.notify(&run_id, &event)?;
        }
        Ok(event)
    }

    // --- Watchers ---

    /// Registers a callback fired for every event appended by `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn watch(&self, run_id: RunId, callback: WatchCallback) -> Result<WatchHandle> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .write()
            .map_err(poison_err)?
            .entry(run_id)
            .or_default()
            .push((id, callback));
        Ok(WatchHandle { run_id, id })
    }

    /// Removes a watcher. Returns false if it was already removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn end_watch(&self, handle: WatchHandle) -> Result<bool> {
        let mut watchers = self.watchers.write().map_err(poison_err)?;
        let Some(callbacks) = watchers.get_mut(&handle.run_id) else {
            return Ok(false);
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != handle.id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            watchers.remove(&handle.run_id);
        }
        Ok(removed)
    }

    fn notify(&self, run_id: &RunId, event: &EventRecord) -> Result<()> {
        // Snapshot so callbacks may register or remove watchers.
        let callbacks: Vec<WatchCallback> = self
            .watchers
            .read()
            .map_err(poison_err)?
            .get(run_id)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in callbacks {
            tracing::trace!(
                run_id = %run_id,
                storage_id = %event.storage_id,
                "dispatching event to run watcher"
            );
            callback(event);
        }
        Ok(())
    }

    // --- Inspection and fault injection ---

    /// Returns a copy of the full event log.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn events(&self) -> Result<Vec<EventRecord>> {
        Ok(self.log.read().map_err(poison_err)?.events.clone())
    }

    /// Returns the storage id of the most recent event, `ZERO` if empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn last_storage_id(&self) -> Result<StorageId> {
        Ok(self.log.read().map_err(poison_err)?.last_storage_id)
    }

    /// Number of [`FactStore`] queries served so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Makes every subsequent [`FactStore`] query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn begin_query(&self, query: &str) -> Result<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::storage_with_source(
                format!("{query} query failed"),
                std::io::Error::new(std::io::ErrorKind::NotConnected, "fact store unavailable"),
            ));
        }
        Ok(())
    }
}

impl FactStore for InMemoryFactStore {
    fn latest_materialization(
        &self,
        asset_key: &AssetKey,
        after: Option<StorageId>,
    ) -> Result<Option<MaterializationRecord>> {
        self.begin_query("latest_materialization")?;
        let floor = after.unwrap_or(StorageId::ZERO);
        let log = self.log.read().map_err(poison_err)?;
        Ok(log
            .events
            .iter()
            .rev()
            .take_while(|e| e.storage_id > floor)
            .find(|e| e.kind == EventKind::Materialization && &e.asset_key == asset_key)
            .map(|e| MaterializationRecord {
                asset_key: e.asset_key.clone(),
                storage_id: e.storage_id,
                run_id: e.run_id,
                timestamp: e.timestamp,
            }))
    }

    fn latest_planned_materialization(
        &self,
        asset_key: &AssetKey,
    ) -> Result<Option<PlannedMaterializationRecord>> {
        self.begin_query("latest_planned_materialization")?;
        let log = self.log.read().map_err(poison_err)?;
        Ok(log
            .events
            .iter()
            .rev()
            .filter(|e| e.kind == EventKind::MaterializationPlanned && &e.asset_key == asset_key)
            .find_map(|e| {
                e.run_id.map(|run_id| PlannedMaterializationRecord {
                    asset_key: e.asset_key.clone(),
                    run_id,
                    storage_id: e.storage_id,
                })
            }))
    }

    fn planned_assets_for_run(&self, run_id: &RunId) -> Result<BTreeSet<AssetKey>> {
        self.begin_query("planned_assets_for_run")?;
        let log = self.log.read().map_err(poison_err)?;
        Ok(log
            .events
            .iter()
            .filter(|e| e.kind == EventKind::MaterializationPlanned && e.run_id == Some(*run_id))
            .map(|e| e.asset_key.clone())
            .collect())
    }

    fn is_run_in_progress(&self, run_id: &RunId) -> Result<bool> {
        self.begin_query("is_run_in_progress")?;
        let log = self.log.read().map_err(poison_err)?;
        Ok(log
            .runs
            .get(run_id)
            .is_some_and(|status| status.is_in_progress()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn key(s: &str) -> AssetKey {
        AssetKey::parse(s).unwrap()
    }

    #[test]
    fn storage_ids_start_at_one_and_increase() {
        let store = InMemoryFactStore::new();
        assert_eq!(store.last_storage_id().unwrap(), StorageId::ZERO);

        store.materialize([key("a"), key("b")]).unwrap();
        let ids: Vec<u64> = store
            .events()
            .unwrap()
            .iter()
            .map(|e| e.storage_id.get())
            .collect();
        // two planned events, then two materializations
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn latest_materialization_respects_lower_bound() {
        let store = InMemoryFactStore::new();
        let a = key("a");
        store.materialize([a.clone()]).unwrap();
        let second = store.report_runless_materialization(a.clone()).unwrap();

        let latest = store.latest_materialization(&a, None).unwrap().unwrap();
        assert_eq!(latest.storage_id, second.storage_id);
        assert!(latest.run_id.is_none());

        assert!(store
            .latest_materialization(&a, Some(second.storage_id))
            .unwrap()
            .is_none());
        assert!(store.latest_materialization(&key("b"), None).unwrap().is_none());
    }

    #[test]
    fn run_lifecycle_tracks_progress_and_plans() {
        let store = InMemoryFactStore::new();
        let run = store.launch_run([key("a"), key("b")]).unwrap();

        assert!(store.is_run_in_progress(&run).unwrap());
        assert!(store.latest_materialization(&key("a"), None).unwrap().is_none());
        let planned = store.latest_planned_materialization(&key("a")).unwrap().unwrap();
        assert_eq!(planned.run_id, run);
        assert_eq!(
            store.planned_assets_for_run(&run).unwrap(),
            [key("a"), key("b")].into_iter().collect()
        );

        let records = store.complete_run(&run).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!store.is_run_in_progress(&run).unwrap());
        assert_eq!(store.run_status(&run).unwrap(), Some(RunStatus::Success));
    }

    #[test]
    fn failed_runs_are_not_in_progress_and_materialize_nothing() {
        let store = InMemoryFactStore::new();
        let run = store.launch_run([key("a")]).unwrap();
        store.fail_run(&run).unwrap();

        assert!(!store.is_run_in_progress(&run).unwrap());
        assert!(store.latest_materialization(&key("a"), None).unwrap().is_none());
    }

    #[test]
    fn unknown_runs_are_not_in_progress() {
        let store = InMemoryFactStore::new();
        assert!(!store.is_run_in_progress(&RunId::generate()).unwrap());
        assert!(store.complete_run(&RunId::generate()).is_err());
    }

    #[test]
    fn unavailable_store_fails_queries() {
        let store = InMemoryFactStore::new();
        store.set_unavailable(true);
        let err = store.latest_materialization(&key("a"), None).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.query_count(), 1);

        store.set_unavailable(false);
        assert!(store.latest_materialization(&key("a"), None).is_ok());
    }

    #[test]
    fn watchers_receive_run_events_until_removed() {
        let store = InMemoryFactStore::new();
        let run = store.register_run(RunStatus::Started).unwrap();
        let seen: Arc<Mutex<Vec<StorageId>>> = Arc::default();

        let sink = Arc::clone(&seen);
        let handle = store
            .watch(
                run,
                Arc::new(move |event: &EventRecord| {
                    sink.lock().unwrap().push(event.storage_id);
                }),
            )
            .unwrap();

        store
            .append_materialization(key("a"), Some(run), Utc::now())
            .unwrap();
        // events from other runs are not delivered
        store.materialize([key("b")]).unwrap();

        assert!(store.end_watch(handle).unwrap());
        assert!(!store.end_watch(handle).unwrap());
        store
            .append_materialization(key("a"), Some(run), Utc::now())
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![StorageId::new(1)]);
    }
}
