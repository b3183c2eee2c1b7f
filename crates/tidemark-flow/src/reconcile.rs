//! The reconciliation engine.
//!
//! Given an [`UpstreamMap`] of monitored assets, the persisted cursor and a
//! per-tick [`CachingInstanceQueryer`], [`reconcile`] walks the monitored
//! assets parent-before-child and decides which of them should be
//! materialized. Decisions propagate: once an asset is selected, its children
//! treat it as updated even though nothing has been written yet.
//!
//! ## Decision rules
//!
//! For each parent of an asset, in key order:
//!
//! 1. A parent already selected this tick counts as updated.
//! 2. With `wait_for_in_progress_runs`, a parent whose latest planned
//!    materialization belongs to an in-progress run blocks the asset for this
//!    tick: every parent is reported not updated.
//! 3. Otherwise the latest parent materialization after the asset's cursor
//!    counts as updated, unless the run that produced it also planned the
//!    asset itself. Its storage id is a cursor candidate either way.
//!
//! The asset is selected when all (or any) parents are updated. Assets with
//! no parents are never selected, in either mode: an empty parent set is not
//! treated as "all parents updated", since that would request the asset on
//! every tick.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use tidemark_core::{AssetKey, RunId, StorageId};

use crate::cursor::ReconciliationCursor;
use crate::dag::Dag;
use crate::error::Result;
use crate::graph::UpstreamMap;
use crate::queryer::CachingInstanceQueryer;

/// Policy switches for one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOptions {
    /// Require every parent to be updated (otherwise any one suffices).
    pub wait_for_all_upstream: bool,
    /// Defer assets whose parents are being produced by an in-progress run.
    pub wait_for_in_progress_runs: bool,
}

impl Default for ReconciliationOptions {
    fn default() -> Self {
        Self {
            wait_for_all_upstream: false,
            wait_for_in_progress_runs: true,
        }
    }
}

/// Update status of one parent relative to a child's cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentStatus {
    /// Whether the parent counts as updated for the child.
    pub updated: bool,
    /// Storage id the child's cursor may advance to.
    pub cursor_candidate: Option<StorageId>,
}

/// A parent being produced by a run that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressParent {
    /// The parent asset.
    pub asset_key: AssetKey,
    /// The run that planned it.
    pub run_id: RunId,
}

/// Result of [`parent_updates`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentUpdates {
    /// Status per parent.
    pub statuses: BTreeMap<AssetKey, ParentStatus>,
    /// Set when evaluation stopped early because of an in-progress parent.
    pub blocked_by: Option<InProgressParent>,
}

impl ParentUpdates {
    /// Parents that count as updated.
    #[must_use]
    pub fn updated_parents(&self) -> BTreeSet<AssetKey> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.updated)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Highest cursor candidate across parents.
    #[must_use]
    pub fn max_candidate(&self) -> Option<StorageId> {
        self.statuses
            .values()
            .filter_map(|status| status.cursor_candidate)
            .max()
    }
}

/// Computes the update status of every parent of `asset_key`.
///
/// # Errors
///
/// Propagates fact-store failures.
pub fn parent_updates(
    queryer: &mut CachingInstanceQueryer<'_>,
    asset_key: &AssetKey,
    parents: &BTreeSet<AssetKey>,
    cursor: Option<StorageId>,
    will_materialize: &BTreeSet<AssetKey>,
    wait_for_in_progress_runs: bool,
) -> Result<ParentUpdates> {
    let mut statuses = BTreeMap::new();

    for parent in parents {
        if will_materialize.contains(parent) {
            statuses.insert(
                parent.clone(),
                ParentStatus {
                    updated: true,
                    cursor_candidate: None,
                },
            );
            continue;
        }

        if wait_for_in_progress_runs {
            if let Some(planned) = queryer.latest_planned_materialization(parent)? {
                if queryer.is_run_in_progress(&planned.run_id)? {
                    return Ok(ParentUpdates {
                        statuses: parents
                            .iter()
                            .map(|p| (p.clone(), ParentStatus::default()))
                            .collect(),
                        blocked_by: Some(InProgressParent {
                            asset_key: parent.clone(),
                            run_id: planned.run_id,
                        }),
                    });
                }
            }
        }

        let status = match queryer.latest_materialization(parent, cursor)? {
            Some(record) => {
                let co_materialized = match record.run_id {
                    Some(run_id) => queryer.run_planned_to_materialize(asset_key, &run_id)?,
                    None => false,
                };
                ParentStatus {
                    updated: !co_materialized,
                    cursor_candidate: Some(record.storage_id),
                }
            }
            None => ParentStatus::default(),
        };
        statuses.insert(parent.clone(), status);
    }

    Ok(ParentUpdates {
        statuses,
        blocked_by: None,
    })
}

/// Why an asset was or was not selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Enough parents were updated.
    Selected,
    /// Not enough parents were updated.
    NotUpdated,
    /// A parent is being produced by an in-progress run.
    BlockedByInProgressRun {
        /// The blocking parent and run.
        parent: InProgressParent,
    },
    /// The asset has no parents to react to.
    NoParents,
}

/// Explanation of one asset's decision in a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEvaluation {
    /// The evaluated asset.
    pub asset_key: AssetKey,
    /// The decision.
    #[serde(flatten)]
    pub decision: Decision,
    /// Parents that counted as updated.
    pub updated_parents: BTreeSet<AssetKey>,
    /// Parents that did not.
    pub stale_parents: BTreeSet<AssetKey>,
    /// New cursor value for the asset, if it advanced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<StorageId>,
}

impl AssetEvaluation {
    /// Returns true if the asset was selected.
    #[must_use]
    pub fn is_selected(&self) -> bool {
        matches!(self.decision, Decision::Selected)
    }
}

/// A request to launch one run materializing the given assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Assets to materialize.
    pub asset_keys: BTreeSet<AssetKey>,
    /// Tags to attach to the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    /// Zero or one run request.
    pub run_requests: Vec<RunRequest>,
    /// Cursor entries advanced this tick.
    pub cursor_updates: BTreeMap<AssetKey, StorageId>,
    /// One explanation per monitored asset, in evaluation order.
    pub evaluations: Vec<AssetEvaluation>,
}

impl ReconciliationOutcome {
    /// Every asset selected this tick.
    #[must_use]
    pub fn selected(&self) -> BTreeSet<AssetKey> {
        self.run_requests
            .iter()
            .flat_map(|request| request.asset_keys.iter().cloned())
            .collect()
    }
}

/// Orders the monitored assets parent-before-child.
///
/// Parents outside the map take part in ordering but are not returned.
///
/// # Errors
///
/// Returns [`crate::error::Error::CycleDetected`] if the map is cyclic.
pub fn evaluation_order(upstream: &UpstreamMap) -> Result<Vec<AssetKey>> {
    let mut dag = Dag::new();
    for key in upstream.keys() {
        dag.add_node(key.clone());
    }
    for (child, parents) in upstream {
        let child_idx = dag.add_node(child.clone());
        for parent in parents {
            let parent_idx = dag.add_node(parent.clone());
            dag.add_edge(parent_idx, child_idx)?;
        }
    }

    Ok(dag
        .toposort()?
        .into_iter()
        .filter(|key| upstream.contains_key(key))
        .collect())
}

/// Runs one reconciliation pass.
///
/// # Errors
///
/// Returns an error if the map is cyclic or a fact-store query fails. No
/// partial outcome is returned on error.
pub fn reconcile(
    upstream: &UpstreamMap,
    queryer: &mut CachingInstanceQueryer<'_>,
    cursor: &ReconciliationCursor,
    options: ReconciliationOptions,
    run_tags: &BTreeMap<String, String>,
) -> Result<ReconciliationOutcome> {
    let order = evaluation_order(upstream)?;

    let mut will_materialize = BTreeSet::new();
    let mut cursor_updates = BTreeMap::new();
    let mut evaluations = Vec::with_capacity(order.len());

    for asset_key in order {
        let parents = upstream.get(&asset_key).cloned().unwrap_or_default();
        let previous = cursor.get(&asset_key);

        if parents.is_empty() {
            tracing::debug!(asset = %asset_key, "no parents, skipping");
            evaluations.push(AssetEvaluation {
                asset_key,
                decision: Decision::NoParents,
                updated_parents: BTreeSet::new(),
                stale_parents: BTreeSet::new(),
                cursor: None,
            });
            continue;
        }

        let updates = parent_updates(
            queryer,
            &asset_key,
            &parents,
            previous,
            &will_materialize,
            options.wait_for_in_progress_runs,
        )?;
        let updated_parents = updates.updated_parents();
        let stale_parents: BTreeSet<AssetKey> =
            parents.difference(&updated_parents).cloned().collect();

        let selected = if options.wait_for_all_upstream {
            stale_parents.is_empty()
        } else {
            !updated_parents.is_empty()
        };

        let (decision, advanced) = if let Some(parent) = updates.blocked_by {
            tracing::debug!(
                asset = %asset_key,
                parent = %parent.asset_key,
                run_id = %parent.run_id,
                "deferred: parent has an in-progress run"
            );
            (Decision::BlockedByInProgressRun { parent }, None)
        } else if selected {
            let advanced = updates.max_candidate().max(previous);
            if let Some(storage_id) = advanced {
                cursor_updates.insert(asset_key.clone(), storage_id);
            }
            will_materialize.insert(asset_key.clone());
            tracing::debug!(
                asset = %asset_key,
                updated = updated_parents.len(),
                cursor = ?advanced,
                "selected for materialization"
            );
            (Decision::Selected, advanced)
        } else {
            tracing::debug!(
                asset = %asset_key,
                updated = updated_parents.len(),
                stale = stale_parents.len(),
                "not enough updated parents"
            );
            (Decision::NotUpdated, None)
        };

        evaluations.push(AssetEvaluation {
            asset_key,
            decision,
            updated_parents,
            stale_parents,
            cursor: advanced,
        });
    }

    let run_requests = if will_materialize.is_empty() {
        Vec::new()
    } else {
        vec![RunRequest {
            asset_keys: will_materialize,
            tags: run_tags.clone(),
        }]
    };

    Ok(ReconciliationOutcome {
        run_requests,
        cursor_updates,
        evaluations,
    })
}
