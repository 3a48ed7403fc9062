//! Run and checkpoint state for resume capability.
//!
//! A [`RunState`] holds one [`EntityCheckpoint`] per planned entity. The
//! [`CheckpointManager`] owns the state for the duration of a run and
//! persists every transition through a [`StateBackend`].

mod backend;
mod checkpoint;
mod db;
mod file;
mod memory;

pub use backend::StateBackend;
pub use checkpoint::CheckpointManager;
pub use db::DbStateBackend;
pub(crate) use db::SYNC_SCHEMA;
pub use file::FileStateBackend;
pub use memory::MemoryStateBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conflict::ConflictRecord;
use crate::error::{MigrateError, Result};

/// Durable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Per-entity checkpoints.
    pub entities: BTreeMap<String, EntityCheckpoint>,

    /// When the run finished (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// Conflicts awaiting an operator decision.
    #[serde(default)]
    pub pending_conflicts: Vec<ConflictRecord>,

    /// HMAC-SHA256 signature, set by the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every entity completed.
    Completed,
    /// Finished with at least one failed or skipped entity.
    Partial,
    Failed,
    Cancelled,
}

/// Per-entity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Not attempted because a dependency failed or was skipped.
    Skipped,
}

/// Progress of one entity within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityCheckpoint {
    pub status: TaskStatus,

    /// Last committed legacy id. Lags the rows written, never leads them.
    pub cursor: Option<i64>,

    /// Source rows read in committed batches.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub unchanged: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub conflicts: u64,
    #[serde(default)]
    pub batches: u64,

    /// Failure or skip reason.
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Create a new run with every entity pending.
    pub fn new<'a>(
        run_id: String,
        config_hash: String,
        entities: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            entities: entities
                .into_iter()
                .map(|e| (e.to_string(), EntityCheckpoint::default()))
                .collect(),
            completed_at: None,
            pending_conflicts: Vec::new(),
            hmac: None,
        }
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Get or create an entity checkpoint.
    pub fn checkpoint_mut(&mut self, entity: &str) -> &mut EntityCheckpoint {
        self.entities.entry(entity.to_string()).or_default()
    }

    /// Check if an entity is completed.
    pub fn is_entity_completed(&self, entity: &str) -> bool {
        self.entities
            .get(entity)
            .map(|c| c.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// Whether the run can no longer be resumed.
    pub fn is_finished(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

impl EntityCheckpoint {
    /// Whether resuming this entity continues from its cursor.
    pub fn resumes_from_cursor(&self) -> bool {
        matches!(self.status, TaskStatus::InProgress | TaskStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_has_pending_entities() {
        let state = RunState::new("run-1".into(), "abc".into(), ["offices", "doctors"]);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.entities.len(), 2);
        assert!(state
            .entities
            .values()
            .all(|c| c.status == TaskStatus::Pending && c.cursor.is_none()));
    }

    #[test]
    fn test_config_validation() {
        let state = RunState::new("run-1".into(), "abc123".into(), std::iter::empty());
        assert!(state.validate_config("abc123").is_ok());
        assert!(matches!(
            state.validate_config("different"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_resumes_from_cursor() {
        let mut cp = EntityCheckpoint::default();
        assert!(!cp.resumes_from_cursor());
        cp.status = TaskStatus::InProgress;
        assert!(cp.resumes_from_cursor());
        cp.status = TaskStatus::Failed;
        assert!(cp.resumes_from_cursor());
        cp.status = TaskStatus::Skipped;
        assert!(!cp.resumes_from_cursor());
    }

    #[test]
    fn test_checkpoint_deserializes_without_optional_counters() {
        let cp: EntityCheckpoint = serde_json::from_str(
            r#"{"status":"in_progress","cursor":40,"processed":40,"succeeded":39,"failed":1,
                "error":null,"started_at":null,"updated_at":null,"completed_at":null}"#,
        )
        .unwrap();
        assert_eq!(cp.status, TaskStatus::InProgress);
        assert_eq!(cp.cursor, Some(40));
        assert_eq!(cp.batches, 0);
    }
}
