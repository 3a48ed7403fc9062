//! End-to-end runs over the in-memory stores.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use legacy_sync::state::{FileStateBackend, MemoryStateBackend};
use legacy_sync::store::{OrphanScan, UpsertOutcome};
use legacy_sync::{
    Config, ConflictOutcome, ConflictStrategy, EntityDefinition, FnTransform, MappingStore, MemoryMappingStore,
    MemorySource, MemoryTarget, MigrateError, Orchestrator, RetryPolicy, Row, RunEvent, RunOutcome, StateBackend,
    Stores, TargetStore, TaskStatus, TransformError, TransformRegistry, ValidationOutcome,
};

fn row(v: serde_json::Value) -> Row {
    Row::from_json(v).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        operation_timeout: Duration::from_secs(5),
    }
}

fn offices() -> EntityDefinition {
    EntityDefinition::new("offices", "legacy.tbl_office", "public.offices")
}

fn doctors() -> EntityDefinition {
    EntityDefinition::new("doctors", "legacy.tbl_doctor", "public.doctors").with_reference("office_id", "offices")
}

fn config(entities: Vec<EntityDefinition>) -> Config {
    let mut config = Config::default();
    config.entities = entities;
    config.run.concurrency = Some(2);
    config.run.retry = fast_retry();
    config
}

fn clinic_source() -> MemorySource {
    MemorySource::new()
        .with_rows(
            "legacy.tbl_office",
            [
                row(json!({"id": 1, "name": "Main"})),
                row(json!({"id": 2, "name": "North"})),
                row(json!({"id": 3, "name": "South"})),
            ],
        )
        .with_rows(
            "legacy.tbl_doctor",
            [
                row(json!({"id": 10, "name": "Grey", "office_id": 1})),
                row(json!({"id": 11, "name": "House", "office_id": 2})),
                row(json!({"id": 12, "name": "Quinn", "office_id": 999})),
                row(json!({"id": 13, "name": "Watson", "office_id": 3})),
            ],
        )
}

/// Target wrapper that records upserts and can be scripted to break.
#[derive(Default)]
struct ScriptedTarget {
    inner: MemoryTarget,
    /// Upserts of `(entity, legacy_id >= n)` fail with a store error.
    broken: Mutex<Option<(String, i64)>>,
    /// Upserts of `(entity, legacy_id >= n)` lose the connection.
    unreachable: Mutex<Option<(String, i64)>>,
    /// First upsert of this entity cancels the token.
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
    upserts: Mutex<HashMap<String, Vec<i64>>>,
    attempts: Mutex<HashMap<(String, i64), u32>>,
}

impl ScriptedTarget {
    fn break_from(&self, entity: &str, legacy_id: i64) {
        *self.broken.lock().unwrap() = Some((entity.to_string(), legacy_id));
    }

    fn unreachable_from(&self, entity: &str, legacy_id: i64) {
        *self.unreachable.lock().unwrap() = Some((entity.to_string(), legacy_id));
    }

    fn attempts(&self, entity: &str, legacy_id: i64) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&(entity.to_string(), legacy_id))
            .copied()
            .unwrap_or(0)
    }

    fn repair(&self) {
        *self.broken.lock().unwrap() = None;
    }

    fn cancel_on(&self, entity: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((entity.to_string(), token));
    }

    fn upserts(&self, entity: &str) -> Vec<i64> {
        self.upserts.lock().unwrap().get(entity).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TargetStore for ScriptedTarget {
    async fn upsert(
        &self,
        entity: &EntityDefinition,
        legacy_id: i64,
        new_id: Uuid,
        row: &Row,
    ) -> legacy_sync::Result<(Uuid, UpsertOutcome)> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry((entity.name.clone(), legacy_id))
            .or_default() += 1;
        if let Some((name, from)) = self.unreachable.lock().unwrap().as_ref() {
            if *name == entity.name && legacy_id >= *from {
                return Err(MigrateError::connectivity("upsert", "connection reset by peer"));
            }
        }
        if let Some((name, from)) = self.broken.lock().unwrap().as_ref() {
            if *name == entity.name && legacy_id >= *from {
                return Err(MigrateError::Store("disk full".into()));
            }
        }
        if let Some((name, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *name == entity.name {
                token.cancel();
            }
        }
        self.upserts
            .lock()
            .unwrap()
            .entry(entity.name.clone())
            .or_default()
            .push(legacy_id);
        self.inner.upsert(entity, legacy_id, new_id, row).await
    }

    async fn fetch(&self, entity: &EntityDefinition, legacy_id: i64) -> legacy_sync::Result<Option<Row>> {
        self.inner.fetch(entity, legacy_id).await
    }

    async fn count(&self, entity: &EntityDefinition) -> legacy_sync::Result<u64> {
        self.inner.count(entity).await
    }

    async fn find_orphans(
        &self,
        child: &EntityDefinition,
        column: &str,
        parent: &EntityDefinition,
        limit: usize,
    ) -> legacy_sync::Result<OrphanScan> {
        self.inner.find_orphans(child, column, parent, limit).await
    }

    async fn scan_column(
        &self,
        entity: &EntityDefinition,
        column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> legacy_sync::Result<Vec<(i64, Option<String>)>> {
        self.inner.scan_column(entity, column, after, limit).await
    }

    async fn ping(&self) -> legacy_sync::Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &'static str {
        "scripted"
    }
}

struct Harness {
    source: Arc<MemorySource>,
    target: Arc<ScriptedTarget>,
    mapping: Arc<MemoryMappingStore>,
    state: Arc<dyn StateBackend>,
}

impl Harness {
    fn new(source: MemorySource) -> Self {
        Self {
            source: Arc::new(source),
            target: Arc::new(ScriptedTarget::default()),
            mapping: Arc::new(MemoryMappingStore::new()),
            state: Arc::new(MemoryStateBackend::new()),
        }
    }

    fn with_state(mut self, state: Arc<dyn StateBackend>) -> Self {
        self.state = state;
        self
    }

    fn stores(&self) -> Stores {
        Stores {
            source: self.source.clone(),
            target: self.target.clone(),
            mapping: self.mapping.clone(),
            state: self.state.clone(),
        }
    }

    fn orchestrator(&self, config: &Config) -> Orchestrator {
        Orchestrator::new(config.clone(), TransformRegistry::new(), self.stores()).unwrap()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_offices_then_doctors() {
    let h = Harness::new(clinic_source());
    let config = config(vec![doctors(), offices()]);

    let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.levels, vec![vec!["offices".to_string()], vec!["doctors".to_string()]]);

    let offices_report = report.entity("offices").unwrap();
    assert_eq!(offices_report.status, TaskStatus::Completed);
    assert_eq!(offices_report.inserted, 3);

    let doctors_report = report.entity("doctors").unwrap();
    assert_eq!(doctors_report.status, TaskStatus::Completed);
    assert_eq!(doctors_report.inserted, 3);
    assert_eq!(doctors_report.skipped, 1);
    assert_eq!(doctors_report.skips.len(), 1);
    assert_eq!(doctors_report.skips[0].legacy_id, Some(12));
    assert_eq!(doctors_report.skips[0].reason, "unresolved office reference: 999");

    // Doctor rows point at the new office ids.
    let office = h.mapping.lookup("offices", 1).await.unwrap().unwrap();
    let grey = h.target.inner.fetch(&doctors(), 10).await.unwrap().unwrap();
    assert_eq!(grey.get("office_id"), Some(&json!(office.new_id.to_string())));
    assert_eq!(grey.get("name"), Some(&json!("Grey")));
    assert!(grey.get("id").is_some());
    assert_eq!(h.mapping.count("doctors").await.unwrap(), 3);

    let validation = report.validation.unwrap();
    let integrity: Vec<_> = validation
        .results
        .iter()
        .filter(|r| r.check.to_string() == "referential_integrity")
        .collect();
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0].outcome, ValidationOutcome::Pass);
    // One skipped doctor leaves a count gap on a non-critical entity.
    assert_eq!(validation.outcome(), ValidationOutcome::Warn);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let h = Harness::new(clinic_source());
    let config = config(vec![offices(), doctors()]);

    let first = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    let ids: Vec<Uuid> = h.mapping.snapshot("offices").await.iter().map(|r| r.new_id).collect();

    let second = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.outcome, RunOutcome::Success);
    assert_eq!(second.rows_inserted(), 0);
    assert_eq!(second.rows_updated(), 0);
    assert_eq!(second.entity("offices").unwrap().unchanged, 3);
    assert_eq!(second.entity("doctors").unwrap().unchanged, 3);
    // The unresolved doctor is retried and skipped again.
    assert_eq!(second.entity("doctors").unwrap().skipped, 1);

    let again: Vec<Uuid> = h.mapping.snapshot("offices").await.iter().map(|r| r.new_id).collect();
    assert_eq!(ids, again);
    assert_eq!(h.target.upserts("offices").len(), 3);
}

#[tokio::test]
async fn test_levels_run_in_dependency_order() {
    let source = MemorySource::new()
        .with_rows("legacy.a", [row(json!({"id": 1}))])
        .with_rows("legacy.b", [row(json!({"id": 1, "a_id": 1}))])
        .with_rows("legacy.c", [row(json!({"id": 1, "b_id": 1}))])
        .with_rows("legacy.d", [row(json!({"id": 1}))]);
    let h = Harness::new(source);
    let config = config(vec![
        EntityDefinition::new("c", "legacy.c", "public.c").with_reference("b_id", "b"),
        EntityDefinition::new("b", "legacy.b", "public.b").with_reference("a_id", "a"),
        EntityDefinition::new("a", "legacy.a", "public.a"),
        EntityDefinition::new("d", "legacy.d", "public.d"),
    ]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = h
        .orchestrator(&config)
        .with_events(tx)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);

    let events = drain(&mut rx);
    let started = |name: &str| {
        events
            .iter()
            .position(|e| matches!(e, RunEvent::EntityStarted { entity, .. } if entity == name))
            .unwrap()
    };
    let finished = |name: &str| {
        events
            .iter()
            .position(|e| matches!(e, RunEvent::EntityFinished { entity, .. } if entity == name))
            .unwrap()
    };

    assert!(finished("a") < started("b"));
    assert!(finished("d") < started("b"));
    assert!(finished("b") < started("c"));
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { levels: 3, entities: 4, .. })));
    assert!(matches!(events.last(), Some(RunEvent::RunFinished { outcome, .. }) if outcome == "success"));

    let levels: Vec<(String, usize)> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::EntityStarted { entity, level, .. } => Some((entity.clone(), *level)),
            _ => None,
        })
        .collect();
    assert!(levels.contains(&("c".to_string(), 2)));
    assert!(levels.contains(&("d".to_string(), 0)));
}

#[tokio::test]
async fn test_resume_after_target_failure() {
    let h = Harness::new(clinic_source());
    let mut doctors = doctors();
    doctors.batch_size = Some(2);
    let config = config(vec![offices(), doctors]);

    h.target.break_from("doctors", 12);
    let first = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::PartialSuccess);
    assert_eq!(first.outcome.exit_code(), 2);

    let failed = first.entity("doctors").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.cursor, Some(11));
    assert!(failed.error.as_deref().unwrap_or_default().contains("disk full"));
    assert_eq!(h.target.upserts("doctors"), vec![10, 11]);

    h.target.repair();
    let resumed = h
        .orchestrator(&config)
        .resume()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.entity("doctors").unwrap().status, TaskStatus::Completed);
    assert_eq!(resumed.entity("doctors").unwrap().cursor, Some(13));

    // Committed rows are not written again; offices are not revisited.
    assert_eq!(h.target.upserts("doctors"), vec![10, 11, 13]);
    assert_eq!(h.target.upserts("offices").len(), 3);
    assert_eq!(h.mapping.count("doctors").await.unwrap(), 3);
}

#[tokio::test]
async fn test_resume_rejects_changed_config() {
    let h = Harness::new(clinic_source());
    let config = config(vec![offices(), doctors()]);
    h.target.break_from("doctors", 0);
    h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    h.target.repair();

    let mut changed = config.clone();
    changed.entities[1].batch_size = Some(1);
    let run_id = h.state.load_latest(&config.hash()).await.unwrap().unwrap().run_id;

    let err = h
        .orchestrator(&changed)
        .with_run_id(run_id.clone())
        .resume()
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::ConfigChanged));

    let report = h
        .orchestrator(&changed)
        .with_run_id(run_id)
        .resume()
        .force()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
}

#[tokio::test]
async fn test_cancel_mid_entity_then_resume_from_file_state() {
    let dir = tempfile::tempdir().unwrap();
    let state: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path().join("state.json")));
    let h = Harness::new(clinic_source()).with_state(state);
    let mut doctors = doctors();
    doctors.batch_size = Some(2);
    let config = config(vec![offices(), doctors]);

    let cancel = CancellationToken::new();
    h.target.cancel_on("doctors", cancel.clone());
    let first = h.orchestrator(&config).run(cancel).await.unwrap();

    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.outcome.exit_code(), 130);
    assert!(first.validation.is_none());
    let partial = first.entity("doctors").unwrap();
    assert_eq!(partial.status, TaskStatus::InProgress);
    assert_eq!(partial.cursor, Some(11));
    assert_eq!(partial.batches, 1);

    // The in-flight batch finished before the run stopped.
    assert_eq!(h.mapping.count("doctors").await.unwrap(), 2);

    h.target.cancel_on("nothing", CancellationToken::new());
    let resumed = h
        .orchestrator(&config)
        .resume()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.entity("doctors").unwrap().cursor, Some(13));
    assert_eq!(h.target.upserts("doctors"), vec![10, 11, 13]);
}

#[tokio::test]
async fn test_cancel_before_start_writes_nothing() {
    let h = Harness::new(clinic_source());
    let config = config(vec![offices(), doctors()]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.orchestrator(&config).run(cancel).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.entities.iter().all(|e| e.status == TaskStatus::Pending));
    assert_eq!(h.mapping.count("offices").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_skips_dependents_only() {
    let source = clinic_source().with_rows("legacy.tbl_patient", [row(json!({"id": 7, "name": "Doe"}))]);
    let h = Harness::new(source);
    let config = config(vec![
        offices(),
        doctors(),
        EntityDefinition::new("patients", "legacy.tbl_patient", "public.patients"),
    ]);
    h.target.break_from("offices", 0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = h
        .orchestrator(&config)
        .with_events(tx)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.entity("offices").unwrap().status, TaskStatus::Failed);
    assert_eq!(report.entity("patients").unwrap().status, TaskStatus::Completed);

    let skipped = report.entity("doctors").unwrap();
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert_eq!(skipped.error.as_deref(), Some("dependency offices failed"));
    assert!(h.target.upserts("doctors").is_empty());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::EntityFinished { entity, status: TaskStatus::Skipped, .. } if entity == "doctors"
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::EntityStarted { entity, .. } if entity == "doctors")));
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_entity() {
    let source = clinic_source().with_rows("legacy.tbl_patient", [row(json!({"id": 7, "name": "Doe"}))]);
    let h = Harness::new(source);
    let config = config(vec![
        offices(),
        doctors(),
        EntityDefinition::new("patients", "legacy.tbl_patient", "public.patients"),
    ]);
    h.target.unreachable_from("offices", 2);

    let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    let failed = report.entity("offices").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(h.target.attempts("offices", 2), fast_retry().max_attempts);
    assert_eq!(h.target.attempts("offices", 3), 0);
    assert_eq!(h.target.upserts("offices"), vec![1]);

    assert_eq!(report.entity("patients").unwrap().status, TaskStatus::Completed);
    assert_eq!(h.target.upserts("patients"), vec![7]);
    assert_eq!(report.entity("doctors").unwrap().status, TaskStatus::Skipped);
}

#[tokio::test]
async fn test_nine_written_one_skipped_across_batches() {
    let mut doctors_rows = Vec::new();
    for id in 100..110 {
        let office = if id == 104 { 42 } else { 1 };
        doctors_rows.push(row(json!({"id": id, "name": format!("dr{}", id), "office_id": office})));
    }
    let source = MemorySource::new()
        .with_rows("legacy.tbl_office", [row(json!({"id": 1, "name": "Main"}))])
        .with_rows("legacy.tbl_doctor", doctors_rows);
    let h = Harness::new(source);
    let mut doctors = doctors();
    doctors.batch_size = Some(3);
    let config = config(vec![offices(), doctors]);

    let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    let doctors_report = report.entity("doctors").unwrap();
    assert_eq!(doctors_report.inserted, 9);
    assert_eq!(doctors_report.skipped, 1);
    assert_eq!(doctors_report.processed, 10);
    assert_eq!(doctors_report.batches, 4);
    assert_eq!(doctors_report.cursor, Some(109));
    assert_eq!(doctors_report.skips[0].reason, "unresolved office reference: 42");
    assert_eq!(h.mapping.lookup("doctors", 104).await.unwrap(), None);
}

#[tokio::test]
async fn test_manual_conflict_is_deferred() {
    let h = Harness::new(clinic_source());
    let mut config = config(vec![offices(), doctors()]);
    config.run.conflict_strategy = ConflictStrategy::Manual;
    h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();

    h.source
        .update_row("legacy.tbl_office", "id", 1, row(json!({"id": 1, "name": "Main Street"})))
        .await;

    let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!((conflict.entity.as_str(), conflict.legacy_id), ("offices", 1));
    assert_eq!(conflict.outcome, ConflictOutcome::PendingManual);
    assert_eq!(conflict.changed_fields, vec!["name".to_string()]);

    let stored = h.target.inner.fetch(&offices(), 1).await.unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&json!("Main")));

    let orchestrator = h.orchestrator(&config).with_run_id(report.run_id.clone());
    let pending = orchestrator.pending_conflicts().await.unwrap();
    assert_eq!(pending, report.conflicts);
}

#[tokio::test]
async fn test_source_wins_and_target_wins() {
    for (strategy, expected_name, expected_updated, expected_outcome) in [
        (ConflictStrategy::SourceWins, "Main Street", 1, ConflictOutcome::SourceApplied),
        (ConflictStrategy::TargetWins, "Main (edited)", 0, ConflictOutcome::TargetKept),
    ] {
        let h = Harness::new(clinic_source());
        let mut config = config(vec![offices(), doctors()]);
        config.run.conflict_strategy = strategy;
        h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
        let original_id = h.mapping.lookup("offices", 1).await.unwrap().unwrap().new_id;

        h.target
            .inner
            .set_field("public.offices", 1, "name", json!("Main (edited)"))
            .await;
        h.source
            .update_row("legacy.tbl_office", "id", 1, row(json!({"id": 1, "name": "Main Street"})))
            .await;

        let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
        assert!(report.conflicts.is_empty(), "{}", strategy);
        assert_eq!(report.entity("offices").unwrap().updated, expected_updated, "{}", strategy);
        assert_eq!(report.entity("offices").unwrap().conflicts, 1, "{}", strategy);
        let records = &report.entity("offices").unwrap().conflict_records;
        assert_eq!(records.len(), 1, "{}", strategy);
        assert_eq!(records[0].outcome, expected_outcome);
        assert_eq!(records[0].old_values.as_ref().and_then(|r| r.get("name")), Some(&json!("Main (edited)")));

        let stored = h.target.inner.fetch(&offices(), 1).await.unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&json!(expected_name)), "{}", strategy);
        assert_eq!(h.mapping.lookup("offices", 1).await.unwrap().unwrap().new_id, original_id);

        // Either way the stored hash now matches the source.
        let settled = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
        assert_eq!(settled.entity("offices").unwrap().unchanged, 3, "{}", strategy);
        assert_eq!(settled.entity("offices").unwrap().conflicts, 0, "{}", strategy);
    }
}

#[tokio::test]
async fn test_cycle_is_rejected_before_io() {
    let h = Harness::new(MemorySource::new());
    let config = config(vec![
        EntityDefinition::new("offices", "legacy.tbl_office", "public.offices").with_reference("head_id", "doctors"),
        doctors(),
    ]);

    let err = Orchestrator::new(config, TransformRegistry::new(), h.stores()).err().unwrap();
    assert_eq!(err.exit_code(), 1);
    match err {
        MigrateError::CyclicDependency { entities } => assert_eq!(entities, vec!["doctors", "offices"]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(h.target.upserts("offices").is_empty());
    assert!(h.state.load_latest("anything").await.unwrap().is_none());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let h = Harness::new(clinic_source());
    let mut config = config(vec![offices(), doctors()]);
    config.run.dry_run = true;

    let report = h.orchestrator(&config).run(CancellationToken::new()).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.outcome, RunOutcome::Success);

    let diff = report.entity("offices").unwrap().diff.clone().unwrap();
    assert_eq!((diff.source_rows, diff.missing, diff.unchanged), (3, 3, 0));
    assert_eq!(report.entity("doctors").unwrap().diff.as_ref().map(|d| d.missing), Some(4));

    assert_eq!(h.mapping.count("offices").await.unwrap(), 0);
    assert!(h.target.upserts("offices").is_empty());
    assert!(h.state.load_latest(&config.hash()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_custom_transform_and_row_failures() {
    let h = Harness::new(
        MemorySource::new().with_rows(
            "legacy.tbl_office",
            [
                row(json!({"id": 1, "name": "main"})),
                row(json!({"id": 2, "name": ""})),
                row(json!({"id": 3, "name": "south"})),
            ],
        ),
    );
    let mut offices = offices();
    offices.transform = Some("office".into());
    let config = config(vec![offices.clone()]);

    let transforms = TransformRegistry::new().with(
        "office",
        FnTransform(|source: &Row, _refs: &legacy_sync::ResolvedRefs| {
            let name = source.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            if name.is_empty() {
                return Err(TransformError::new("office name is empty"));
            }
            let mut out = Row::new();
            out.insert("display_name", name.to_uppercase());
            Ok(out)
        }),
    );

    let orchestrator = Orchestrator::new(config.clone(), transforms, h.stores()).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let entity = report.entity("offices").unwrap();
    assert_eq!(entity.status, TaskStatus::Completed);
    assert_eq!((entity.inserted, entity.failed), (2, 1));
    assert_eq!(entity.failures[0].legacy_id, Some(2));
    assert!(entity.failures[0].error.contains("office name is empty"));

    let stored = h.target.inner.fetch(&offices, 3).await.unwrap().unwrap();
    assert_eq!(stored.get("display_name"), Some(&json!("SOUTH")));

    let err = Orchestrator::new(config, TransformRegistry::new(), h.stores()).err().unwrap();
    assert_eq!(err.exit_code(), 1);
}
