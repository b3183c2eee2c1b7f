//! End-to-end reconciliation scenarios over the in-memory fact store.
//!
//! The reference graph used throughout:
//!
//! ```text
//! a   b   c
//!  \ / \ /
//!   d   e
//!    \ /
//!     f
//! ```
//!
//! with `d`, `e` and `f` monitored.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;

use tidemark_core::{AssetKey, StorageId};
use tidemark_flow::cursor::ReconciliationCursor;
use tidemark_flow::error::Error;
use tidemark_flow::graph::{AssetDefinition, AssetGraph, AssetSelection, SourceAsset};
use tidemark_flow::reconcile::Decision;
use tidemark_flow::sensor::{
    build_asset_reconciliation_sensor, AssetReconciliationSensor, SensorStatus,
};
use tidemark_flow::store::memory::InMemoryFactStore;

fn key(s: &str) -> AssetKey {
    AssetKey::parse(s).expect("valid key")
}

fn keys(items: &[&str]) -> BTreeSet<AssetKey> {
    items.iter().map(|s| key(s)).collect()
}

fn asset(name: &str, deps: &[&str]) -> AssetDefinition {
    AssetDefinition::new(key(name), deps.iter().map(|d| key(d)))
}

fn reference_graph() -> AssetGraph {
    AssetGraph::from_parts(
        [
            asset("a", &[]),
            asset("b", &[]),
            asset("c", &[]),
            asset("d", &["a", "b"]),
            asset("e", &["b", "c"]),
            asset("f", &["d", "e"]),
        ],
        [],
    )
    .expect("valid graph")
}

fn sensor(wait_for_all_upstream: bool) -> AssetReconciliationSensor {
    build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["d", "e", "f"])), "reconcile")
        .wait_for_all_upstream(wait_for_all_upstream)
        .build()
        .expect("valid sensor")
}

fn requested(tick: &tidemark_flow::sensor::TickResult) -> BTreeSet<AssetKey> {
    tick.run_requests
        .iter()
        .flat_map(|r| r.asset_keys.iter().cloned())
        .collect()
}

#[test]
fn all_upstream_propagates_through_graph() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();

    let tick = sensor(true).evaluate_tick(&graph, &store, None).unwrap();

    assert_eq!(tick.run_requests.len(), 1);
    assert_eq!(requested(&tick), keys(&["d", "e", "f"]));
    // planned events take ids 1-3, materializations a=4, b=5, c=6
    assert_eq!(tick.cursor, r#"{"version":1,"consumed":{"d":5,"e":6}}"#);
}

#[test]
fn all_upstream_waits_for_every_parent() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b"])).unwrap();

    let tick = sensor(true).evaluate_tick(&graph, &store, None).unwrap();

    assert_eq!(requested(&tick), keys(&["d"]));
    let e = tick
        .evaluations
        .iter()
        .find(|ev| ev.asset_key == key("e"))
        .unwrap();
    assert_eq!(e.decision, Decision::NotUpdated);
    assert_eq!(e.stale_parents, keys(&["c"]));
}

#[test]
fn any_upstream_triggers_on_single_parent() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["b"])).unwrap();

    let tick = sensor(false).evaluate_tick(&graph, &store, None).unwrap();

    assert_eq!(requested(&tick), keys(&["d", "e", "f"]));
}

#[test]
fn co_materialized_parents_do_not_trigger_child() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c", "d", "e"])).unwrap();

    let tick = sensor(true).evaluate_tick(&graph, &store, None).unwrap();

    // d and e were refreshed by the same run as their parents; f was not.
    assert_eq!(requested(&tick), keys(&["f"]));
}

#[test]
fn co_materialized_parent_still_advances_cursor() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    // planned a=1, materialized a=2
    store.materialize(keys(&["a"])).unwrap();
    // planned b=3 d=4, materialized b=5 d=6
    store.materialize(keys(&["b", "d"])).unwrap();

    let tick = sensor(false).evaluate_tick(&graph, &store, None).unwrap();

    let d = tick
        .evaluations
        .iter()
        .find(|ev| ev.asset_key == key("d"))
        .unwrap();
    assert_eq!(d.decision, Decision::Selected);
    assert_eq!(d.updated_parents, keys(&["a"]));
    assert_eq!(d.stale_parents, keys(&["b"]));
    assert_eq!(d.cursor, Some(StorageId::new(5)));

    let cursor = ReconciliationCursor::decode(Some(&tick.cursor)).unwrap();
    assert_eq!(cursor.get(&key("d")), Some(StorageId::new(5)));
}

#[test]
fn no_new_facts_means_no_requests() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();
    let sensor = sensor(true);

    let first = sensor.evaluate_tick(&graph, &store, None).unwrap();
    let second = sensor
        .evaluate_tick(&graph, &store, Some(&first.cursor))
        .unwrap();
    let third = sensor
        .evaluate_tick(&graph, &store, Some(&second.cursor))
        .unwrap();

    assert!(second.run_requests.is_empty());
    assert!(third.run_requests.is_empty());
    assert_eq!(second.cursor, first.cursor);
    assert_eq!(third.cursor, first.cursor);
}

#[test]
fn cursor_values_never_decrease() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    let sensor = sensor(false);
    let mut cursor: Option<String> = None;
    let mut previous = ReconciliationCursor::default();

    let batches: [&[&str]; 5] = [&["a"], &["b", "c"], &["a"], &["c"], &["a", "b", "c"]];
    for batch in batches {
        store.materialize(keys(batch)).unwrap();
        let tick = sensor
            .evaluate_tick(&graph, &store, cursor.as_deref())
            .unwrap();
        let decoded = ReconciliationCursor::decode(Some(&tick.cursor)).unwrap();
        for (asset_key, storage_id) in previous.iter() {
            let now = decoded.get(asset_key).expect("entries are never dropped");
            assert!(now >= storage_id, "{asset_key} moved backwards");
        }
        previous = decoded;
        cursor = Some(tick.cursor);
    }
    assert!(!previous.is_empty());
}

#[test]
fn in_progress_parent_defers_child_until_run_completes() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();
    let run = store.launch_run(keys(&["a"])).unwrap();
    let sensor = sensor(true);

    let first = sensor.evaluate_tick(&graph, &store, None).unwrap();
    assert_eq!(requested(&first), keys(&["e"]));
    let d = first
        .evaluations
        .iter()
        .find(|ev| ev.asset_key == key("d"))
        .unwrap();
    match &d.decision {
        Decision::BlockedByInProgressRun { parent } => {
            assert_eq!(parent.asset_key, key("a"));
            assert_eq!(parent.run_id, run);
        }
        other => panic!("expected d to be blocked, got {other:?}"),
    }
    assert!(d.cursor.is_none());

    store.complete_run(&run).unwrap();
    let second = sensor
        .evaluate_tick(&graph, &store, Some(&first.cursor))
        .unwrap();
    assert_eq!(requested(&second), keys(&["d"]));
}

#[test]
fn in_progress_runs_are_ignored_when_not_waiting() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();
    store.launch_run(keys(&["a"])).unwrap();

    let sensor =
        build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["d", "e", "f"])), "eager")
            .wait_for_all_upstream(true)
            .wait_for_in_progress_runs(false)
            .build()
            .unwrap();

    let tick = sensor.evaluate_tick(&graph, &store, None).unwrap();
    assert_eq!(requested(&tick), keys(&["d", "e", "f"]));
}

#[test]
fn failed_parent_run_does_not_block() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b"])).unwrap();
    let run = store.launch_run(keys(&["a"])).unwrap();
    store.fail_run(&run).unwrap();

    let tick = sensor(true).evaluate_tick(&graph, &store, None).unwrap();
    assert_eq!(requested(&tick), keys(&["d"]));
}

#[test]
fn source_parent_without_facts_blocks_all_upstream_mode() {
    let graph = AssetGraph::from_parts(
        [asset("a", &[]), asset("d", &["s", "a"])],
        [SourceAsset::new(key("s"))],
    )
    .unwrap();
    let sensor = build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["d"])), "src")
        .wait_for_all_upstream(true)
        .build()
        .unwrap();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a"])).unwrap();

    let first = sensor.evaluate_tick(&graph, &store, None).unwrap();
    assert!(first.run_requests.is_empty());
    assert_eq!(first.evaluations[0].stale_parents, keys(&["s"]));

    store.report_runless_materialization(key("s")).unwrap();
    let second = sensor
        .evaluate_tick(&graph, &store, Some(&first.cursor))
        .unwrap();
    assert_eq!(requested(&second), keys(&["d"]));
}

#[test]
fn undeclared_dependencies_are_ignored() {
    let graph = AssetGraph::from_parts([asset("a", &[]), asset("x", &["a", "ghost"])], []).unwrap();
    let sensor = build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["x"])), "ghosts")
        .wait_for_all_upstream(true)
        .build()
        .unwrap();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a"])).unwrap();

    let tick = sensor.evaluate_tick(&graph, &store, None).unwrap();
    assert_eq!(requested(&tick), keys(&["x"]));
}

#[test]
fn run_requests_carry_tags() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["b"])).unwrap();
    let sensor =
        build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["d"])), "tagged")
            .run_tag("team", "data")
            .build()
            .unwrap();

    let tick = sensor.evaluate_tick(&graph, &store, None).unwrap();
    assert_eq!(tick.run_requests[0].tags["team"], "data");
}

#[test]
fn cyclic_selection_fails_the_tick() {
    let graph = AssetGraph::from_parts(
        [asset("root", &[]), asset("p", &["q", "root"]), asset("q", &["p"])],
        [],
    )
    .unwrap();
    let sensor = build_asset_reconciliation_sensor(AssetSelection::all(), "cyclic")
        .build()
        .unwrap();
    let store = InMemoryFactStore::new();

    let err = sensor.evaluate_tick(&graph, &store, None).unwrap_err();
    match err {
        Error::CycleDetected { cycle } => {
            assert!(cycle.contains(&"p".to_string()));
            assert!(cycle.contains(&"q".to_string()));
        }
        other => panic!("expected cycle error, got {other}"),
    }
}

#[test]
fn malformed_cursor_aborts_without_touching_state() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();
    let sensor = sensor(true);

    let err = sensor
        .evaluate_tick(&graph, &store, Some("{not json"))
        .unwrap_err();
    assert!(matches!(err, Error::CursorDecode { .. }));

    let mut state = sensor.initial_state();
    state.status = SensorStatus::Running;
    state.cursor = Some("[]".to_string());
    let now = chrono::Utc::now();
    assert!(sensor.tick(&mut state, &graph, &store, now).is_err());
    assert_eq!(state.cursor.as_deref(), Some("[]"));
}

#[test]
fn legacy_cursor_is_honoured() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a", "b", "c"])).unwrap();

    let tick = sensor(true)
        .evaluate_tick(&graph, &store, Some(r#"{"d":5,"e":6}"#))
        .unwrap();
    assert!(tick.run_requests.is_empty());
    let cursor = ReconciliationCursor::decode(Some(&tick.cursor)).unwrap();
    assert_eq!(cursor.get(&key("d")), Some(StorageId::new(5)));
}

#[test]
fn store_failures_propagate() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    store.materialize(keys(&["a"])).unwrap();
    store.set_unavailable(true);

    let err = sensor(true).evaluate_tick(&graph, &store, None).unwrap_err();
    assert!(matches!(err, Error::Storage { .. }));
}

#[test]
fn unknown_selected_key_is_rejected() {
    let graph = reference_graph();
    let store = InMemoryFactStore::new();
    let sensor =
        build_asset_reconciliation_sensor(AssetSelection::keys(keys(&["missing"])), "missing")
            .build()
            .unwrap();

    let err = sensor.evaluate_tick(&graph, &store, None).unwrap_err();
    assert!(matches!(err, Error::DependencyNotFound { .. }));
}
