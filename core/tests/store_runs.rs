use churn_core::{
    config::PipelineConfig,
    error::ChurnError,
    event::RunEvent,
    features::{registry::FeatureRegistry, FeatureRow, FeatureValue},
    store::{universe_key, ChurnStore, CommitOutcome, OutputKey, RunKind, RunStatus},
    types::Date,
};
use std::collections::BTreeMap;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn bare_store() -> ChurnStore {
    let store = ChurnStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
}

/// Store with the `fs-test-1` schema registered, as every feature run does first.
fn setup() -> ChurnStore {
    let store = bare_store();
    let registry = FeatureRegistry::standard(&PipelineConfig::default_test().features);
    store.register_feature_schema(&registry).unwrap();
    store
}

fn asof() -> Date {
    Date::from_ymd_opt(2026, 2, 1).unwrap()
}

fn key(ids: &[&str]) -> OutputKey {
    let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    OutputKey {
        kind:           RunKind::Features,
        universe_key:   universe_key(&ids),
        period_date:    asof(),
        schema_version: "fs-test-1".into(),
    }
}

fn row(entity: &str, tenure: f64) -> FeatureRow {
    let mut values = BTreeMap::new();
    values.insert("tenure_days".to_string(), FeatureValue::Numeric(tenure));
    FeatureRow::new(entity.into(), asof(), "fs-test-1".into(), values)
}

fn note(entity: &str) -> RunEvent {
    RunEvent::CoverageDefault { entity_id: entity.into() }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn completed_run_is_readable_with_its_events() {
    let store = setup();
    let k = key(&["A", "B"]);
    store.begin_run("run-1", &k).unwrap();
    assert_eq!(store.run_status("run-1").unwrap(), RunStatus::Started);
    assert!(store.feature_rows(asof(), "fs-test-1").unwrap().is_empty(), "nothing is visible before commit");

    let outcome = store.commit_feature_run("run-1", &k, &[row("A", 10.0), row("B", 20.0)], &[note("B")]).unwrap();
    assert_eq!(outcome, CommitOutcome::Completed { rows_written: 2, rows_already_recorded: 0 });

    let m = store.manifest("run-1").unwrap();
    assert_eq!(m.status, RunStatus::Completed);
    assert_eq!(m.row_count, 2);
    assert!(m.finished_at.is_some());
    assert_eq!(store.run_of_record(&k).unwrap(), Some("run-1".to_string()));

    let rows = store.feature_rows(asof(), "fs-test-1").unwrap();
    assert_eq!(rows, vec![row("A", 10.0), row("B", 20.0)]);

    let events = store.events_for_run("run-1").unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["coverage_default", "run_completed"]);
    assert_eq!(events[0].event().unwrap(), note("B"));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
}

/// A second run for the same key writes nothing and points at the first.
#[test]
fn second_run_for_same_key_is_superseded() {
    let store = setup();
    let k = key(&["A"]);
    store.begin_run("run-1", &k).unwrap();
    store.commit_feature_run("run-1", &k, &[row("A", 10.0)], &[]).unwrap();

    store.begin_run("run-2", &k).unwrap();
    let outcome = store.commit_feature_run("run-2", &k, &[row("A", 99.0)], &[note("A")]).unwrap();
    assert_eq!(outcome, CommitOutcome::Duplicate { of_record_run_id: "run-1".into() });
    assert_eq!(store.run_status("run-2").unwrap(), RunStatus::Superseded);
    assert_eq!(store.feature_rows(asof(), "fs-test-1").unwrap(), vec![row("A", 10.0)], "first write stands");
    assert_eq!(store.count_events("run-2", "run_superseded").unwrap(), 1);
    assert_eq!(store.count_events("run-2", "coverage_default").unwrap(), 0, "loser's buffered events are dropped");
}

/// A different universe is a different key, but rows already written for
/// the same (entity, asof, schema) are never rewritten.
#[test]
fn overlapping_universe_keeps_existing_rows() {
    let store = setup();
    let k1 = key(&["A"]);
    store.begin_run("run-1", &k1).unwrap();
    store.commit_feature_run("run-1", &k1, &[row("A", 10.0)], &[]).unwrap();

    let k2 = key(&["A", "B"]);
    store.begin_run("run-2", &k2).unwrap();
    let outcome = store.commit_feature_run("run-2", &k2, &[row("A", 99.0), row("B", 20.0)], &[]).unwrap();
    assert_eq!(outcome, CommitOutcome::Completed { rows_written: 1, rows_already_recorded: 1 });
    assert_eq!(store.feature_rows(asof(), "fs-test-1").unwrap(), vec![row("A", 10.0), row("B", 20.0)]);
}

#[test]
fn aborted_run_leaves_only_its_marker() {
    let store = setup();
    let k = key(&["A"]);
    store.begin_run("run-1", &k).unwrap();
    store.mark_run_aborted("run-1", 2).unwrap();

    assert_eq!(store.run_status("run-1").unwrap(), RunStatus::Aborted);
    assert_eq!(store.run_of_record(&k).unwrap(), None);
    let events = store.events_for_run("run-1").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event().unwrap(), RunEvent::RunAborted { run_id: "run-1".into(), batches_done: 2 });

    assert!(store.commit_feature_run("run-1", &k, &[row("A", 1.0)], &[]).is_err(), "aborted runs cannot commit");
    assert!(store.feature_rows(asof(), "fs-test-1").unwrap().is_empty());
}

#[test]
fn unknown_runs_are_reported() {
    let store = bare_store();
    assert!(matches!(store.manifest("nope"), Err(ChurnError::RunNotFound { .. })));
    assert!(matches!(store.mark_run_aborted("nope", 0), Err(ChurnError::RunNotFound { .. })));
}

#[test]
fn run_ids_are_unique() {
    let store = setup();
    store.begin_run("run-1", &key(&["A"])).unwrap();
    assert!(store.begin_run("run-1", &key(&["B"])).is_err());
}

/// Re-registering a schema is idempotent; changing its definition is not.
#[test]
fn schema_definitions_are_immutable() {
    let store = bare_store();
    let mut cfg = PipelineConfig::default_test();
    let registry = FeatureRegistry::standard(&cfg.features);
    assert!(store.register_feature_schema(&registry).unwrap());
    assert!(!store.register_feature_schema(&registry).unwrap());
    assert!(store.feature_schema_definition("fs-test-1").unwrap().is_some());

    cfg.features.disabled = vec!["tenure_days".into()];
    let changed = FeatureRegistry::standard(&cfg.features);
    assert!(matches!(
        store.register_feature_schema(&changed),
        Err(ChurnError::SchemaDefinitionConflict { .. })
    ));
}

#[test]
fn universe_key_ignores_order() {
    let a = universe_key(&["A".to_string(), "B".to_string()]);
    let b = universe_key(&["B".to_string(), "A".to_string()]);
    assert_eq!(a, b);
    assert_ne!(a, universe_key(&["A".to_string()]));
}
