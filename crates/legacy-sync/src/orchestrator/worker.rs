//! Batch loop for a single entity.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BatchSizes;
use crate::conflict::ConflictRecord;
use crate::diff::{DiffBatch, DifferentialAnalyzer};
use crate::entity::EntityDefinition;
use crate::error::Result;
use crate::event::{EventSink, RunEvent};
use crate::executor::{BatchExecutor, BatchOutcome, RowFailure, SkipRecord};
use crate::state::CheckpointManager;

/// Cap on skip, failure and conflict records kept per entity for the run report.
/// Checkpoint counters stay exact past the cap.
const MAX_REPORTED_ROWS: usize = 1_000;

/// What one invocation of an entity produced besides its checkpoint.
#[derive(Debug, Default)]
pub(crate) struct EntityRun {
    pub skips: Vec<SkipRecord>,
    pub failures: Vec<RowFailure>,
    pub conflicts: Vec<ConflictRecord>,
    /// Stopped before the source was exhausted; the entity stays in progress.
    pub cancelled: bool,
}

pub(crate) struct EntityWorker {
    pub analyzer: DifferentialAnalyzer,
    pub executor: BatchExecutor,
    pub checkpoints: Arc<CheckpointManager>,
    pub events: EventSink,
    pub batch_sizes: BatchSizes,
}

impl EntityWorker {
    /// Migrate one entity from its checkpoint to the end of the source.
    ///
    /// The [`EntityRun`] is returned even when the entity fails so the report
    /// keeps the rows skipped before the failure.
    pub(crate) async fn run(
        &self,
        entity: Arc<EntityDefinition>,
        level: usize,
        cancel: &CancellationToken,
    ) -> (EntityRun, Result<()>) {
        let mut run = EntityRun::default();
        let result = self.migrate(entity, level, cancel, &mut run).await;
        (run, result)
    }

    async fn migrate(
        &self,
        entity: Arc<EntityDefinition>,
        level: usize,
        cancel: &CancellationToken,
        run: &mut EntityRun,
    ) -> Result<()> {
        let name = entity.name.clone();
        let resume_from = self.checkpoints.begin_entity(&name).await?;
        let batch_size = self.batch_sizes.for_entity(&entity);
        match resume_from {
            Some(cursor) => info!("{}: resuming after legacy id {} (batch size {})", name, cursor, batch_size),
            None => info!("{}: starting (batch size {})", name, batch_size),
        }
        self.events.emit(RunEvent::EntityStarted {
            entity: name.clone(),
            level,
            resume_from,
        });

        let mut cursor = self.analyzer.open(entity.clone(), resume_from, batch_size).await?;
        loop {
            if cancel.is_cancelled() {
                info!("{}: cancellation requested, leaving entity resumable", name);
                run.cancelled = true;
                return Ok(());
            }
            let Some(batch) = cursor.next_batch().await? else {
                break;
            };

            let outcome = if batch.is_noop() {
                BatchOutcome::default()
            } else {
                self.executor.migrate_batch(&entity, &batch).await?
            };
            self.checkpoints
                .commit_batch(&name, batch.last_key, batch.rows_read, batch.unchanged, &outcome)
                .await?;
            self.publish(&name, &batch, outcome, run).await;
        }

        self.checkpoints.complete_entity(&name).await
    }

    /// Emit events for a committed batch and keep its row records.
    async fn publish(&self, entity: &str, batch: &DiffBatch, outcome: BatchOutcome, run: &mut EntityRun) {
        for skip in &outcome.skips {
            self.events.emit(RunEvent::RowSkipped {
                entity: entity.to_string(),
                legacy_id: skip.legacy_id,
                reason: skip.reason.clone(),
            });
        }
        for conflict in &outcome.conflicts {
            self.events.emit(RunEvent::ConflictDetected {
                entity: entity.to_string(),
                legacy_id: conflict.legacy_id,
                strategy: conflict.strategy,
                outcome: conflict.outcome,
            });
        }

        let batches = self
            .checkpoints
            .checkpoint(entity)
            .await
            .map(|cp| cp.batches)
            .unwrap_or_default();
        debug!(
            "{}: batch {} committed, cursor {:?}, {} read, {} unchanged",
            entity, batches, batch.last_key, batch.rows_read, batch.unchanged
        );
        self.events.emit(RunEvent::BatchCommitted {
            entity: entity.to_string(),
            batch: batches,
            cursor: batch.last_key,
            inserted: outcome.inserted,
            updated: outcome.updated,
            skipped: outcome.skipped,
            failed: outcome.failed,
        });

        let room = MAX_REPORTED_ROWS.saturating_sub(run.skips.len());
        run.skips.extend(outcome.skips.into_iter().take(room));
        let room = MAX_REPORTED_ROWS.saturating_sub(run.failures.len());
        run.failures.extend(outcome.failures.into_iter().take(room));
        let room = MAX_REPORTED_ROWS.saturating_sub(run.conflicts.len());
        run.conflicts.extend(outcome.conflicts.into_iter().take(room));
    }
}
