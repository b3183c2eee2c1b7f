//! Scenario files: an asset graph, a sensor configuration and a history of
//! runs to replay into an in-memory fact store.
//!
//! ```json
//! {
//!   "sensor": { "name": "nightly", "wait_for_all_upstream": true },
//!   "assets": [
//!     { "key": "orders" },
//!     { "key": "daily_orders", "deps": ["orders", "raw/events"] }
//!   ],
//!   "source_assets": [{ "key": "raw/events" }],
//!   "runs": [
//!     { "label": "backfill", "assets": ["orders"] },
//!     { "label": "ingest", "assets": ["raw/events"], "runless": true },
//!     { "label": "nightly", "assets": ["daily_orders"], "status": "started" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::{AssetKey, RunId};
use tidemark_flow::config::SensorConfig;
use tidemark_flow::graph::{AssetDefinition, AssetGraph, SourceAsset};
use tidemark_flow::store::memory::InMemoryFactStore;
use tidemark_flow::store::RunStatus;

/// A replayable reconciliation scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    /// Sensor configuration.
    pub sensor: SensorConfig,
    /// Assets produced by runs.
    pub assets: Vec<AssetDefinition>,
    /// Externally produced assets.
    pub source_assets: Vec<SourceAsset>,
    /// Run history, replayed in order.
    pub runs: Vec<ScenarioRun>,
}

/// One entry of the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioRun {
    /// Human-readable name used in output.
    pub label: String,
    /// Assets the run planned to materialize.
    #[serde(default)]
    pub assets: Vec<AssetKey>,
    /// Final status of the run.
    #[serde(default = "default_status")]
    pub status: RunStatus,
    /// Assets actually materialized. Defaults to every planned asset for
    /// successful runs and to none otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialized: Option<Vec<AssetKey>>,
    /// Timestamp of the materializations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialized_at: Option<DateTime<Utc>>,
    /// Record the assets as materialized outside any run.
    #[serde(default)]
    pub runless: bool,
}

const fn default_status() -> RunStatus {
    RunStatus::Success
}

impl ScenarioRun {
    fn materialized_assets(&self) -> Vec<AssetKey> {
        match &self.materialized {
            Some(assets) => assets.clone(),
            None if self.runless || self.status == RunStatus::Success => self.assets.clone(),
            None => Vec::new(),
        }
    }
}

/// Run labels mapped to the ids generated during replay.
pub type RunLabels = BTreeMap<RunId, String>;

impl Scenario {
    /// Loads a scenario from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid scenario {}", path.display()))
    }

    /// Parses a scenario from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a run label repeats.
    pub fn parse(raw: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(raw)?;
        let mut seen = std::collections::BTreeSet::new();
        for run in &scenario.runs {
            if !seen.insert(run.label.as_str()) {
                bail!("duplicate run label {:?}", run.label);
            }
        }
        Ok(scenario)
    }

    /// Builds the asset graph.
    ///
    /// # Errors
    ///
    /// Returns an error if an asset is declared twice.
    pub fn graph(&self) -> Result<AssetGraph> {
        AssetGraph::from_parts(self.assets.iter().cloned(), self.source_assets.iter().cloned())
            .context("invalid asset graph")
    }

    /// Replays the run history into `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects an append.
    pub fn replay(&self, store: &InMemoryFactStore) -> Result<RunLabels> {
        let mut labels = RunLabels::new();
        for run in &self.runs {
            let timestamp = run.materialized_at.unwrap_or_else(Utc::now);

            if run.runless {
                for asset_key in run.materialized_assets() {
                    store.append_materialization(asset_key, None, timestamp)?;
                }
                tracing::debug!(label = %run.label, "replayed runless materializations");
                continue;
            }

            let run_id = store
                .launch_run(run.assets.iter().cloned())
                .with_context(|| format!("failed to launch run {:?}", run.label))?;
            for asset_key in run.materialized_assets() {
                store.append_materialization(asset_key, Some(run_id), timestamp)?;
            }
            store.set_run_status(&run_id, run.status)?;
            tracing::debug!(label = %run.label, run_id = %run_id, status = ?run.status, "replayed run");
            labels.insert(run_id, run.label.clone());
        }
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_flow::store::FactStore;

    const SCENARIO: &str = r#"{
        "sensor": {"name": "nightly", "wait_for_all_upstream": true},
        "assets": [
            {"key": "orders"},
            {"key": "daily_orders", "deps": ["orders", "raw/events"]}
        ],
        "source_assets": [{"key": "raw/events"}],
        "runs": [
            {"label": "backfill", "assets": ["orders"]},
            {"label": "ingest", "assets": ["raw/events"], "runless": true},
            {"label": "nightly", "assets": ["daily_orders"], "status": "started"},
            {"label": "broken", "assets": ["orders", "daily_orders"],
             "status": "failure", "materialized": ["orders"]}
        ]
    }"#;

    fn key(s: &str) -> AssetKey {
        AssetKey::parse(s).unwrap()
    }

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        assert_eq!(scenario.sensor.name, "nightly");
        assert!(scenario.sensor.wait_for_all_upstream);
        assert_eq!(scenario.assets.len(), 2);
        assert_eq!(scenario.runs[0].status, RunStatus::Success);
        assert!(scenario.runs[1].runless);
        assert!(scenario.graph().is_ok());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let err = Scenario::parse(r#"{"runs": [{"label": "x"}, {"label": "x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate run label"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(Scenario::parse(r#"{"asets": []}"#).is_err());
    }

    #[test]
    fn test_replay_records_runs() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let store = InMemoryFactStore::new();
        let labels = scenario.replay(&store).unwrap();

        // Runless entries get no label.
        assert_eq!(labels.len(), 3);

        let orders = store.latest_materialization(&key("orders"), None).unwrap().unwrap();
        assert_eq!(labels[&orders.run_id.unwrap()], "broken");

        let events = store.latest_materialization(&key("raw/events"), None).unwrap().unwrap();
        assert!(events.run_id.is_none());

        assert!(store
            .latest_materialization(&key("daily_orders"), None)
            .unwrap()
            .is_none());
        let planned = store
            .latest_planned_materialization(&key("daily_orders"))
            .unwrap()
            .unwrap();
        assert_eq!(labels[&planned.run_id], "broken");
        assert_eq!(
            store.run_status(&planned.run_id).unwrap(),
            Some(RunStatus::Failure)
        );
    }
}
