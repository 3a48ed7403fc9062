//! Checkpoint manager: the per-entity state machine of a run.
//!
//! ```text
//! pending ──> in_progress ──> completed
//!    │             └────────> failed ──> in_progress (resume)
//!    └──> skipped ──────────────────────> in_progress (resume)
//! ```
//!
//! Every transition is persisted before the call returns. The cursor only
//! moves in [`CheckpointManager::commit_batch`], which the caller invokes
//! after the batch's rows are committed.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{EntityCheckpoint, RunState, RunStatus, StateBackend, TaskStatus};
use crate::conflict::{ConflictOutcome, ConflictRecord};
use crate::error::Result;
use crate::executor::BatchOutcome;

/// Owns the run state and persists every transition.
pub struct CheckpointManager {
    backend: Arc<dyn StateBackend>,
    state: Mutex<RunState>,
}

impl CheckpointManager {
    /// Start tracking `state` and persist it immediately.
    pub async fn open(backend: Arc<dyn StateBackend>, mut state: RunState) -> Result<Self> {
        state.status = RunStatus::Running;
        state.completed_at = None;
        backend.save(&state).await?;
        debug!("run {} tracked by {} state backend", state.run_id, backend.backend_type());
        Ok(Self {
            backend,
            state: Mutex::new(state),
        })
    }

    pub async fn run_id(&self) -> String {
        self.state.lock().await.run_id.clone()
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> RunState {
        self.state.lock().await.clone()
    }

    /// Copy of one entity's checkpoint.
    pub async fn checkpoint(&self, entity: &str) -> Option<EntityCheckpoint> {
        self.state.lock().await.entities.get(entity).cloned()
    }

    /// Move the entity to in_progress and return the cursor to resume from.
    ///
    /// In-progress and failed entities keep their cursor and counters; any
    /// other status starts from the beginning.
    pub async fn begin_entity(&self, entity: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cp = state.checkpoint_mut(entity);
        if !cp.resumes_from_cursor() {
            *cp = EntityCheckpoint {
                started_at: Some(now),
                ..EntityCheckpoint::default()
            };
        }
        cp.status = TaskStatus::InProgress;
        cp.error = None;
        cp.updated_at = Some(now);
        let cursor = cp.cursor;
        self.backend.save(&state).await?;
        Ok(cursor)
    }

    /// Record a committed batch and advance the cursor to `last_key`.
    pub async fn commit_batch(
        &self,
        entity: &str,
        last_key: Option<i64>,
        rows_read: usize,
        unchanged: usize,
        outcome: &BatchOutcome,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let cp = state.checkpoint_mut(entity);
        if let Some(k) = last_key {
            cp.cursor = Some(cp.cursor.map_or(k, |c| c.max(k)));
        }
        cp.processed += rows_read as u64;
        cp.succeeded += outcome.succeeded();
        cp.failed += outcome.failed;
        cp.inserted += outcome.inserted;
        cp.updated += outcome.updated;
        cp.unchanged += unchanged as u64;
        cp.skipped += outcome.skipped;
        cp.conflicts += outcome.conflicts.len() as u64;
        cp.batches += 1;
        cp.updated_at = Some(Utc::now());

        merge_pending(&mut state.pending_conflicts, &outcome.conflicts);

        self.backend.save(&state).await
    }

    pub async fn complete_entity(&self, entity: &str) -> Result<()> {
        self.finish_entity(entity, TaskStatus::Completed, None).await
    }

    pub async fn fail_entity(&self, entity: &str, error: &str) -> Result<()> {
        self.finish_entity(entity, TaskStatus::Failed, Some(error.to_string()))
            .await
    }

    pub async fn skip_entity(&self, entity: &str, reason: &str) -> Result<()> {
        self.finish_entity(entity, TaskStatus::Skipped, Some(reason.to_string()))
            .await
    }

    async fn finish_entity(&self, entity: &str, status: TaskStatus, error: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cp = state.checkpoint_mut(entity);
        cp.status = status;
        cp.error = error;
        cp.updated_at = Some(now);
        if status == TaskStatus::Completed {
            cp.completed_at = Some(now);
        }
        self.backend.save(&state).await
    }

    /// Set the final run status.
    pub async fn finish_run(&self, status: RunStatus) -> Result<RunState> {
        let mut state = self.state.lock().await;
        state.status = status;
        if status != RunStatus::Cancelled {
            state.completed_at = Some(Utc::now());
        }
        self.backend.save(&state).await?;
        Ok(state.clone())
    }
}

/// Fold a batch's conflict outcomes into the pending list. Any outcome for
/// a row supersedes its earlier record; only manual ones stay pending.
fn merge_pending(pending: &mut Vec<ConflictRecord>, new: &[ConflictRecord]) {
    for record in new {
        pending.retain(|p| !(p.entity == record.entity && p.legacy_id == record.legacy_id));
        if record.outcome == ConflictOutcome::PendingManual {
            pending.push(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use crate::row::Row;
    use crate::state::MemoryStateBackend;
    use uuid::Uuid;

    async fn manager() -> (Arc<MemoryStateBackend>, CheckpointManager) {
        let backend = Arc::new(MemoryStateBackend::new());
        let state = RunState::new("run-1".into(), "hash".into(), ["offices", "doctors"]);
        let mgr = CheckpointManager::open(backend.clone(), state).await.unwrap();
        (backend, mgr)
    }

    fn outcome(inserted: u64, failed: u64) -> BatchOutcome {
        BatchOutcome {
            inserted,
            failed,
            ..BatchOutcome::default()
        }
    }

    #[tokio::test]
    async fn test_transitions_are_persisted() {
        let (backend, mgr) = manager().await;

        assert_eq!(mgr.begin_entity("offices").await.unwrap(), None);
        let saved = backend.load("run-1").await.unwrap().unwrap();
        assert_eq!(saved.entities["offices"].status, TaskStatus::InProgress);

        mgr.commit_batch("offices", Some(50), 50, 0, &outcome(49, 1)).await.unwrap();
        let saved = backend.load("run-1").await.unwrap().unwrap();
        let cp = &saved.entities["offices"];
        assert_eq!(cp.cursor, Some(50));
        assert_eq!((cp.processed, cp.succeeded, cp.failed, cp.batches), (50, 49, 1, 1));

        mgr.complete_entity("offices").await.unwrap();
        mgr.skip_entity("doctors", "dependency offices failed").await.unwrap();
        let saved = backend.load("run-1").await.unwrap().unwrap();
        assert_eq!(saved.entities["offices"].status, TaskStatus::Completed);
        assert_eq!(saved.entities["doctors"].status, TaskStatus::Skipped);
        assert_eq!(
            saved.entities["doctors"].error.as_deref(),
            Some("dependency offices failed")
        );
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (_, mgr) = manager().await;
        mgr.begin_entity("offices").await.unwrap();
        mgr.commit_batch("offices", Some(100), 10, 0, &outcome(10, 0)).await.unwrap();
        mgr.commit_batch("offices", None, 0, 0, &outcome(0, 0)).await.unwrap();
        assert_eq!(mgr.checkpoint("offices").await.unwrap().cursor, Some(100));
    }

    #[tokio::test]
    async fn test_failed_entity_resumes_from_cursor() {
        let (backend, mgr) = manager().await;
        mgr.begin_entity("offices").await.unwrap();
        mgr.commit_batch("offices", Some(20), 20, 0, &outcome(20, 0)).await.unwrap();
        mgr.fail_entity("offices", "connection reset").await.unwrap();

        let state = backend.load("run-1").await.unwrap().unwrap();
        let resumed = CheckpointManager::open(backend.clone(), state).await.unwrap();
        assert_eq!(resumed.begin_entity("offices").await.unwrap(), Some(20));
        let cp = resumed.checkpoint("offices").await.unwrap();
        assert_eq!(cp.processed, 20);
        assert!(cp.error.is_none());

        // A skipped entity starts over.
        resumed.skip_entity("doctors", "dependency offices failed").await.unwrap();
        assert_eq!(resumed.begin_entity("doctors").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_manual_conflicts_are_kept_once_per_row() {
        let (_, mgr) = manager().await;
        let record = |outcome| ConflictRecord {
            entity: "offices".into(),
            legacy_id: 3,
            new_id: Uuid::nil(),
            old_values: None,
            new_values: Row::new(),
            changed_fields: vec![],
            strategy: ConflictStrategy::Manual,
            outcome,
            detected_at: Utc::now(),
        };
        let batch = BatchOutcome {
            conflicts: vec![record(ConflictOutcome::PendingManual)],
            ..BatchOutcome::default()
        };
        mgr.begin_entity("offices").await.unwrap();
        mgr.commit_batch("offices", Some(3), 1, 0, &batch).await.unwrap();
        mgr.commit_batch("offices", Some(3), 1, 0, &batch).await.unwrap();
        assert_eq!(mgr.snapshot().await.pending_conflicts.len(), 1);

        let applied = BatchOutcome {
            conflicts: vec![record(ConflictOutcome::SourceApplied)],
            ..BatchOutcome::default()
        };
        mgr.commit_batch("offices", Some(3), 1, 0, &applied).await.unwrap();

        let state = mgr.snapshot().await;
        assert!(state.pending_conflicts.is_empty());
        assert_eq!(state.entities["offices"].conflicts, 3);
    }

    #[tokio::test]
    async fn test_kept_target_clears_pending_conflict() {
        let (_, mgr) = manager().await;
        let record = |legacy_id, outcome| ConflictRecord {
            entity: "offices".into(),
            legacy_id,
            new_id: Uuid::nil(),
            old_values: None,
            new_values: Row::new(),
            changed_fields: vec!["name".into()],
            strategy: ConflictStrategy::Manual,
            outcome,
            detected_at: Utc::now(),
        };
        mgr.begin_entity("offices").await.unwrap();
        let pending = BatchOutcome {
            conflicts: vec![
                record(3, ConflictOutcome::PendingManual),
                record(4, ConflictOutcome::PendingManual),
            ],
            ..BatchOutcome::default()
        };
        mgr.commit_batch("offices", Some(4), 0, 0, &pending).await.unwrap();

        let kept = BatchOutcome {
            conflicts: vec![record(3, ConflictOutcome::TargetKept)],
            ..BatchOutcome::default()
        };
        mgr.commit_batch("offices", Some(4), 0, 0, &kept).await.unwrap();

        let ids: Vec<i64> = mgr.snapshot().await.pending_conflicts.iter().map(|c| c.legacy_id).collect();
        assert_eq!(ids, vec![4]);
    }

    #[tokio::test]
    async fn test_finish_run() {
        let (_, mgr) = manager().await;
        let state = mgr.finish_run(RunStatus::Partial).await.unwrap();
        assert_eq!(state.status, RunStatus::Partial);
        assert!(state.completed_at.is_some());

        let state = mgr.finish_run(RunStatus::Cancelled).await.unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
    }
}
