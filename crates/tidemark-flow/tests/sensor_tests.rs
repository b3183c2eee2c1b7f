//! Sensor lifecycle: gating, state persistence, and driving runs to convergence.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};

use tidemark_core::{AssetKey, StorageId};
use tidemark_flow::config::SensorConfig;
use tidemark_flow::freshness::{upstream_materialization_times, FreshnessPolicy};
use tidemark_flow::graph::{AssetDefinition, AssetGraph, AssetSelection};
use tidemark_flow::queryer::CachingInstanceQueryer;
use tidemark_flow::sensor::{
    build_asset_reconciliation_sensor, AssetReconciliationSensor, SensorState, SensorStatus,
};
use tidemark_flow::store::memory::{EventKind, EventRecord, InMemoryFactStore};

fn key(s: &str) -> AssetKey {
    AssetKey::parse(s).expect("valid key")
}

fn keys(items: &[&str]) -> BTreeSet<AssetKey> {
    items.iter().map(|s| key(s)).collect()
}

fn graph() -> AssetGraph {
    AssetGraph::from_parts(
        [
            AssetDefinition::new(key("a"), []),
            AssetDefinition::new(key("b"), []),
            AssetDefinition::new(key("c"), [key("a"), key("b")]),
            AssetDefinition::new(key("d"), [key("c")]),
        ],
        [],
    )
    .unwrap()
}

fn running_sensor() -> AssetReconciliationSensor {
    build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["c", "d"])), "lifecycle")
        .wait_for_all_upstream(true)
        .minimum_interval_seconds(60)
        .default_status(SensorStatus::Running)
        .description("keeps c and d fresh")
        .build()
        .unwrap()
}

#[test]
fn stopped_sensor_skips_ticks() {
    let sensor =
        build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["c"])), "stopped_sensor")
            .build()
            .unwrap();
    let mut state = sensor.initial_state();
    let store = InMemoryFactStore::new();

    let result = sensor.tick(&mut state, &graph(), &store, Utc::now()).unwrap();
    assert!(result.is_none());
    assert!(state.last_evaluation_at.is_none());
}

#[test]
fn tick_gates_on_minimum_interval_and_persists_cursor() {
    let sensor = running_sensor();
    let graph = graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b"])).unwrap();
    let mut state = sensor.initial_state();
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

    let first = sensor.tick(&mut state, &graph, &store, t0).unwrap().unwrap();
    assert_eq!(first.run_requests[0].asset_keys, keys(&["c", "d"]));
    assert_eq!(state.cursor.as_deref(), Some(first.cursor.as_str()));
    assert_eq!(state.last_evaluation_at, Some(t0));

    let early = sensor
        .tick(&mut state, &graph, &store, t0 + Duration::seconds(30))
        .unwrap();
    assert!(early.is_none());
    assert_eq!(state.last_evaluation_at, Some(t0));

    let later = sensor
        .tick(&mut state, &graph, &store, t0 + Duration::seconds(90))
        .unwrap()
        .unwrap();
    assert!(later.run_requests.is_empty());
}

#[test]
fn executing_requested_runs_converges() {
    let sensor = running_sensor();
    let graph = graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b"])).unwrap();

    let mut cursor: Option<String> = None;
    let mut rounds = 0;
    loop {
        let tick = sensor
            .evaluate_tick(&graph, &store, cursor.as_deref())
            .unwrap();
        cursor = Some(tick.cursor);
        if tick.run_requests.is_empty() {
            break;
        }
        for request in tick.run_requests {
            store.materialize(request.asset_keys).unwrap();
        }
        rounds += 1;
        assert!(rounds < 5, "reconciliation did not converge");
    }
    assert_eq!(rounds, 1);
}

#[test]
fn sensor_state_round_trips_through_json() {
    let state = SensorState {
        status: SensorStatus::Running,
        cursor: Some(r#"{"version":1,"consumed":{"c":4}}"#.to_string()),
        last_evaluation_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
    };
    let json = serde_json::to_string(&state).unwrap();
    let back: SensorState = serde_json::from_str(&json).unwrap();
    assert_eq!(back, state);
}

#[test]
fn sensor_from_config_document() {
    let config: SensorConfig = serde_json::from_str(
        r#"{
            "name": "from_config",
            "selection": {"type": "keys", "keys": ["c"]},
            "wait_for_all_upstream": true,
            "run_tags": {"origin": "config"}
        }"#,
    )
    .unwrap();
    let sensor = AssetReconciliationSensor::new(config).unwrap();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b"])).unwrap();

    let tick = sensor.evaluate_tick(&graph(), &store, None).unwrap();
    assert_eq!(tick.run_requests[0].asset_keys, keys(&["c"]));
    assert_eq!(tick.run_requests[0].tags["origin"], "config");
}

#[test]
fn watchers_observe_requested_runs() {
    let store = InMemoryFactStore::new();
    let run = store.launch_run(keys(&["c", "d"])).unwrap();
    let seen: Arc<Mutex<Vec<(EventKind, StorageId)>>> = Arc::default();

    let sink = Arc::clone(&seen);
    let handle = store
        .watch(
            run,
            Arc::new(move |event: &EventRecord| {
                sink.lock().unwrap().push((event.kind, event.storage_id));
            }),
        )
        .unwrap();
    store.complete_run(&run).unwrap();
    store.end_watch(handle).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(kind, _)| *kind == EventKind::Materialization));
    assert!(seen[0].1 < seen[1].1);
}

#[test]
fn freshness_reads_upstream_times_from_store() {
    let store = InMemoryFactStore::new();
    let eval = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    store
        .append_materialization(key("a"), None, eval - Duration::minutes(90))
        .unwrap();
    store
        .append_materialization(key("b"), None, eval - Duration::minutes(10))
        .unwrap();

    let mut queryer = CachingInstanceQueryer::new(&store);
    let times = upstream_materialization_times(&mut queryer, &keys(&["a", "b"])).unwrap();

    let policy = FreshnessPolicy::minimum_freshness(60.0).unwrap();
    assert_eq!(policy.minutes_late(eval, &times), Some(30.0));

    let missing = upstream_materialization_times(&mut queryer, &keys(&["a", "never"])).unwrap();
    assert_eq!(policy.minutes_late(eval, &missing), None);
}
