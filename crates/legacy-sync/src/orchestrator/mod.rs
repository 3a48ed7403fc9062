//! Migration orchestrator - main workflow coordinator.
//!
//! A run walks the execution plan level by level. Entities of one level run
//! concurrently, bounded by `run.concurrency`; the next level starts only
//! once every entity of the current one has finished. An entity that fails
//! takes its dependents down with it (they are skipped), siblings carry on.

mod report;
mod worker;

pub use report::{EntityReport, HealthCheckResult, RunOutcome, RunReport};

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, StateBackendKind};
use crate::conflict::{ConflictRecord, ConflictResolver};
use crate::diff::DifferentialAnalyzer;
use crate::entity::{EntityCatalog, EntityDefinition, TransformRegistry};
use crate::error::{MigrateError, Result};
use crate::event::{EventSink, RunEvent};
use crate::executor::BatchExecutor;
use crate::graph::{DependencyGraph, ExecutionPlan};
use crate::mapping::MappingStore;
use crate::pg::{self, PgMappingStore, PgSource, PgTarget};
use crate::state::{
    CheckpointManager, DbStateBackend, FileStateBackend, MemoryStateBackend, RunState, RunStatus,
    StateBackend, TaskStatus,
};
use crate::store::{SourceStore, TargetStore};
use crate::validate::{ValidationReport, Validator};
use worker::{EntityRun, EntityWorker};

/// The four collaborators a run talks to.
#[derive(Clone)]
pub struct Stores {
    pub source: Arc<dyn SourceStore>,
    pub target: Arc<dyn TargetStore>,
    pub mapping: Arc<dyn MappingStore>,
    pub state: Arc<dyn StateBackend>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    catalog: Arc<EntityCatalog>,
    transforms: TransformRegistry,
    resolver: Arc<ConflictResolver>,
    stores: Stores,
    run_id: Option<String>,
    resume: bool,
    force: bool,
    events: EventSink,
}

impl Orchestrator {
    /// Create an orchestrator over the given stores.
    ///
    /// Fails before any I/O on invalid configuration: bad entity graph or a
    /// transform name missing from `transforms`.
    pub fn new(config: Config, transforms: TransformRegistry, stores: Stores) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        for def in catalog.iter() {
            transforms.resolve(def)?;
        }
        let resolver = Arc::new(ConflictResolver::from_definitions(
            config.run.conflict_strategy,
            catalog.iter().map(|d| d.as_ref()),
        ));

        Ok(Self {
            config,
            catalog,
            transforms,
            resolver,
            stores,
            run_id: None,
            resume: false,
            force: false,
            events: EventSink::default(),
        })
    }

    /// Connect to the configured PostgreSQL databases and build the stores.
    pub async fn connect(config: Config, transforms: TransformRegistry) -> Result<Self> {
        config.validate()?;
        let source_cfg = config
            .source
            .as_ref()
            .ok_or_else(|| MigrateError::Config("source database is not configured".into()))?;
        let target_cfg = config
            .target
            .as_ref()
            .ok_or_else(|| MigrateError::Config("target database is not configured".into()))?;

        let source_pool =
            pg::connect_pool(source_cfg, config.run.get_max_connections(source_cfg), "source").await?;
        let target_pool =
            pg::connect_pool(target_cfg, config.run.get_max_connections(target_cfg), "target").await?;

        let state: Arc<dyn StateBackend> = match config.state.backend {
            StateBackendKind::File => Arc::new(FileStateBackend::new(&config.state.path)),
            StateBackendKind::Postgres => Arc::new(DbStateBackend::new(target_pool.clone())),
            StateBackendKind::Memory => Arc::new(MemoryStateBackend::new()),
        };
        let stores = Stores {
            source: Arc::new(PgSource::new(source_pool)),
            target: Arc::new(PgTarget::new(target_pool.clone())),
            mapping: Arc::new(PgMappingStore::new(target_pool)),
            state,
        };
        Self::new(config, transforms, stores)
    }

    /// Use a fixed run id (new runs) or pick the run to resume.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Continue a previous run instead of starting a new one.
    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    /// Resume even if the configuration changed since the run started.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Stream run events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Leveled execution plan. No I/O.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        DependencyGraph::build(&self.catalog, &self.config.run.entities)
    }

    /// Run the migration until done or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let plan = self.plan()?;
        if self.config.run.dry_run {
            return self.dry_run(&plan, &cancel).await;
        }

        let started = Instant::now();
        let started_at = Utc::now();

        self.stores.mapping.init_schema().await?;
        self.stores.state.init_schema().await?;
        let (state, resumed) = self.initial_state(&plan).await?;
        let already_done: Vec<String> = state
            .entities
            .iter()
            .filter(|(_, cp)| resumed && cp.status == TaskStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect();

        let checkpoints = Arc::new(CheckpointManager::open(self.stores.state.clone(), state).await?);
        let run_id = checkpoints.run_id().await;
        info!(
            "Starting run {}: {} entities in {} levels ({} state)",
            run_id,
            plan.len(),
            plan.levels().len(),
            self.stores.state.backend_type()
        );
        self.events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            entities: plan.len(),
            levels: plan.levels().len(),
            resumed,
        });

        let worker = Arc::new(EntityWorker {
            analyzer: self.analyzer(),
            executor: BatchExecutor::new(
                self.stores.target.clone(),
                self.stores.mapping.clone(),
                self.resolver.clone(),
                self.transforms.clone(),
                self.config.run.retry.clone(),
            ),
            checkpoints: checkpoints.clone(),
            events: self.events.clone(),
            batch_sizes: self.config.run.batch_sizes.clone(),
        });
        let concurrency = self.config.run.get_concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut runs: HashMap<String, EntityRun> = HashMap::new();
        let mut cancelled = false;

        for (level, names) in plan.levels().iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Cancellation requested, not starting level {}", level);
                cancelled = true;
                break;
            }
            info!("Level {}: {}", level, names.join(", "));
            self.events.emit(RunEvent::LevelStarted {
                level,
                entities: names.clone(),
            });

            let mut handles = Vec::new();
            for name in names {
                let Some(def) = plan.entity(name).cloned() else {
                    continue;
                };

                if already_done.contains(name) {
                    info!("{}: already completed in run {}", name, run_id);
                    statuses.insert(name.clone(), TaskStatus::Completed);
                    self.finished(name, TaskStatus::Completed, None);
                    continue;
                }

                if let Some(reason) = blocked_by(&def, &statuses) {
                    warn!("{}: skipped, {}", name, reason);
                    checkpoints.skip_entity(name, &reason).await?;
                    statuses.insert(name.clone(), TaskStatus::Skipped);
                    self.finished(name, TaskStatus::Skipped, Some(reason));
                    continue;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| MigrateError::State("worker pool closed".into()))?;
                let worker = worker.clone();
                let cancel = cancel.clone();
                let handle = tokio::spawn(async move {
                    let result = worker.run(def, level, &cancel).await;
                    drop(permit);
                    result
                });
                handles.push((name.clone(), handle));
            }

            let (names, tasks): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
            for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
                let (run, result) = match joined {
                    Ok(r) => r,
                    Err(e) => (
                        EntityRun::default(),
                        Err(MigrateError::State(format!("task panicked: {}", e))),
                    ),
                };

                let (status, reason) = match result {
                    Ok(()) if run.cancelled => {
                        cancelled = true;
                        (TaskStatus::InProgress, None)
                    }
                    Ok(()) => {
                        info!("{}: completed", name);
                        (TaskStatus::Completed, None)
                    }
                    Err(e) => {
                        error!("{}: failed - {}", name, e);
                        let message = e.to_string();
                        if let Err(se) = checkpoints.fail_entity(&name, &message).await {
                            error!("{}: could not record failure: {}", name, se);
                        }
                        (TaskStatus::Failed, Some(message))
                    }
                };
                self.finished(&name, status, reason);
                statuses.insert(name.clone(), status);
                runs.insert(name, run);
            }

            self.events.emit(RunEvent::LevelFinished { level });
            if cancelled {
                break;
            }
        }

        let unsuccessful = statuses
            .values()
            .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Skipped));
        let (run_status, outcome) = if cancelled {
            (RunStatus::Cancelled, RunOutcome::Cancelled)
        } else if unsuccessful {
            (RunStatus::Partial, RunOutcome::PartialSuccess)
        } else {
            (RunStatus::Completed, RunOutcome::Success)
        };
        let final_state = checkpoints.finish_run(run_status).await?;

        let validation = if !cancelled && self.config.validation.enabled {
            let completed: Vec<&str> = plan
                .levels()
                .iter()
                .flatten()
                .filter(|n| statuses.get(*n) == Some(&TaskStatus::Completed))
                .map(String::as_str)
                .collect();
            let report = self.validator().validate(completed).await;
            self.events.emit(RunEvent::ValidationFinished {
                checks: report.len(),
                outcome: report.outcome(),
            });
            Some(report)
        } else {
            None
        };

        let mut entities = Vec::with_capacity(plan.len());
        for (level, names) in plan.levels().iter().enumerate() {
            for name in names {
                let cp = final_state.entities.get(name).cloned().unwrap_or_default();
                let mut report = EntityReport::from_checkpoint(name, level, &cp);
                if let Some(run) = runs.remove(name) {
                    report.skips = run.skips;
                    report.failures = run.failures;
                    report.conflict_records = run.conflicts;
                }
                entities.push(report);
            }
        }

        let report = RunReport {
            run_id: run_id.clone(),
            outcome,
            dry_run: false,
            resumed,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: started.elapsed().as_secs_f64(),
            levels: plan.levels().to_vec(),
            entities,
            conflicts: final_state.pending_conflicts,
            validation,
        };

        info!(
            "Run {} {}: {} completed, {} failed, {} skipped; {} inserted, {} updated in {:.1}s",
            run_id,
            outcome,
            report.with_status(TaskStatus::Completed).len(),
            report.with_status(TaskStatus::Failed).len(),
            report.with_status(TaskStatus::Skipped).len(),
            report.rows_inserted(),
            report.rows_updated(),
            report.duration_seconds
        );
        self.events.emit(RunEvent::RunFinished {
            run_id,
            outcome: outcome.to_string(),
        });
        Ok(report)
    }

    /// Run validation over every planned entity without migrating.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let plan = self.plan()?;
        let names: Vec<&str> = plan.levels().iter().flatten().map(String::as_str).collect();
        Ok(self.validator().validate(names).await)
    }

    /// Ping the source and target stores.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.stores.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.stores.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.as_ref().err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.as_ref().err().map(|e| e.to_string()),
            healthy: source.is_ok() && target.is_ok(),
        })
    }

    /// Manual conflicts recorded by the selected run (or the latest run for
    /// this configuration). Read-only: nothing is created in the state store.
    pub async fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let state = load_run(self.stores.state.as_ref(), &self.config, self.run_id.as_deref()).await?;
        Ok(state.map(|s| s.pending_conflicts).unwrap_or_default())
    }

    fn analyzer(&self) -> DifferentialAnalyzer {
        DifferentialAnalyzer::new(
            self.stores.source.clone(),
            self.stores.mapping.clone(),
            self.config.run.retry.clone(),
        )
    }

    fn validator(&self) -> Validator {
        Validator::new(
            self.catalog.clone(),
            self.stores.source.clone(),
            self.stores.target.clone(),
            self.stores.mapping.clone(),
            self.transforms.clone(),
            self.config.run.retry.clone(),
            self.config.validation.clone(),
        )
    }

    fn finished(&self, entity: &str, status: TaskStatus, error: Option<String>) {
        self.events.emit(RunEvent::EntityFinished {
            entity: entity.to_string(),
            status,
            error,
        });
    }

    /// Load the run to resume, or start a fresh one.
    async fn initial_state(&self, plan: &ExecutionPlan) -> Result<(RunState, bool)> {
        let hash = self.config.hash();

        if self.resume {
            let loaded = load_run(self.stores.state.as_ref(), &self.config, self.run_id.as_deref()).await?;
            let Some(mut state) = loaded else {
                return Err(MigrateError::State(match &self.run_id {
                    Some(id) => format!("run {} not found", id),
                    None => "no previous run found for this configuration".into(),
                }));
            };

            if state.config_hash != hash {
                if !self.force {
                    return Err(MigrateError::ConfigChanged);
                }
                warn!("Configuration changed since run {}, resuming anyway", state.run_id);
                state.config_hash = hash;
            }
            for name in plan.levels().iter().flatten() {
                state.checkpoint_mut(name);
            }
            info!("Resuming run {} (started {})", state.run_id, state.started_at);
            return Ok((state, true));
        }

        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let names = plan.levels().iter().flatten().map(String::as_str);
        Ok((RunState::new(run_id, hash, names), false))
    }

    /// Count the delta of every planned entity without writing anything.
    async fn dry_run(&self, plan: &ExecutionPlan, cancel: &CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!("Dry run {}: analyzing {} entities, nothing will be written", run_id, plan.len());
        self.events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            entities: plan.len(),
            levels: plan.levels().len(),
            resumed: false,
        });

        let analyzer = self.analyzer();
        let mut entities = Vec::with_capacity(plan.len());
        let mut cancelled = false;
        let mut failed = false;

        'levels: for (level, names) in plan.levels().iter().enumerate() {
            for name in names {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'levels;
                }
                let Some(def) = plan.entity(name).cloned() else {
                    continue;
                };
                let mut report = EntityReport {
                    name: name.clone(),
                    level,
                    ..EntityReport::default()
                };
                let batch_size = self.config.run.batch_sizes.for_entity(&def);
                match analyzer.summarize(def, batch_size).await {
                    Ok(summary) => {
                        info!(
                            "{}: {} source rows, {} to insert, {} conflict candidates, {} unchanged",
                            name,
                            summary.source_rows,
                            summary.missing,
                            summary.conflict_candidates,
                            summary.unchanged
                        );
                        report.diff = Some(summary);
                    }
                    Err(e) => {
                        warn!("{}: analysis failed - {}", name, e);
                        report.status = TaskStatus::Failed;
                        report.error = Some(e.to_string());
                        failed = true;
                    }
                }
                entities.push(report);
            }
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if failed {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        };
        self.events.emit(RunEvent::RunFinished {
            run_id: run_id.clone(),
            outcome: outcome.to_string(),
        });

        Ok(RunReport {
            run_id,
            outcome,
            dry_run: true,
            resumed: false,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: started.elapsed().as_secs_f64(),
            levels: plan.levels().to_vec(),
            entities,
            conflicts: Vec::new(),
            validation: None,
        })
    }
}

/// Open the state backend a configuration points at.
///
/// The `postgres` backend gets its own small pool on the target database.
pub async fn open_state_backend(config: &Config) -> Result<Arc<dyn StateBackend>> {
    Ok(match config.state.backend {
        StateBackendKind::File => Arc::new(FileStateBackend::new(&config.state.path)),
        StateBackendKind::Memory => Arc::new(MemoryStateBackend::new()),
        StateBackendKind::Postgres => {
            let target = config
                .target
                .as_ref()
                .ok_or_else(|| MigrateError::Config("target database is not configured".into()))?;
            Arc::new(DbStateBackend::new(pg::connect_pool(target, 2, "state").await?))
        }
    })
}

/// Load a run by id, or the latest run recorded for this configuration.
/// A state store that was never initialized has no runs.
pub async fn load_run(backend: &dyn StateBackend, config: &Config, run_id: Option<&str>) -> Result<Option<RunState>> {
    if !backend.is_provisioned().await? {
        return Ok(None);
    }
    match run_id {
        Some(id) => backend.load(id).await,
        None => backend.load_latest(&config.hash()).await,
    }
}

/// Reason an entity cannot start, if one of its planned dependencies did
/// not complete. Dependencies outside the plan count as satisfied.
fn blocked_by(def: &EntityDefinition, statuses: &HashMap<String, TaskStatus>) -> Option<String> {
    let mut deps: Vec<&String> = def.depends_on.iter().collect();
    deps.sort();
    deps.into_iter().find_map(|dep| match statuses.get(dep) {
        Some(TaskStatus::Failed) => Some(format!("dependency {} failed", dep)),
        Some(TaskStatus::Skipped) => Some(format!("dependency {} skipped", dep)),
        _ => None,
    })
}
