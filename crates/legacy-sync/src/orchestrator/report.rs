//! Run and health-check reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictRecord;
use crate::diff::DiffSummary;
use crate::error::Result;
use crate::executor::{RowFailure, SkipRecord};
use crate::state::{EntityCheckpoint, TaskStatus};
use crate::validate::ValidationReport;

/// Overall outcome of a run that did not fail fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every planned entity completed.
    Success,
    /// At least one entity failed or was skipped.
    PartialSuccess,
    /// Stopped on request; resumable.
    Cancelled,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialSuccess => 2,
            RunOutcome::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialSuccess => "partial_success",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub name: String,
    pub level: usize,
    pub status: TaskStatus,

    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub batches: u64,
    pub cursor: Option<i64>,

    /// Row skips seen in this invocation (bounded).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<SkipRecord>,

    /// Row failures seen in this invocation (bounded).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RowFailure>,

    /// Conflicts settled (or deferred) in this invocation (bounded).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_records: Vec<ConflictRecord>,

    /// Delta counts, set by dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
}

impl EntityReport {
    pub(crate) fn from_checkpoint(name: &str, level: usize, cp: &EntityCheckpoint) -> Self {
        Self {
            name: name.to_string(),
            level,
            status: cp.status,
            error: cp.error.clone(),
            processed: cp.processed,
            inserted: cp.inserted,
            updated: cp.updated,
            unchanged: cp.unchanged,
            skipped: cp.skipped,
            failed: cp.failed,
            conflicts: cp.conflicts,
            batches: cp.batches,
            cursor: cp.cursor,
            ..Self::default()
        }
    }
}

/// Audit record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    /// Entity names per level, in execution order.
    pub levels: Vec<Vec<String>>,

    /// One report per planned entity, in plan order.
    pub entities: Vec<EntityReport>,

    /// Manual conflicts awaiting an operator decision, across the whole run.
    pub conflicts: Vec<ConflictRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl RunReport {
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Names of entities with the given status.
    pub fn with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.entities.iter().map(|e| e.inserted).sum()
    }

    pub fn rows_updated(&self) -> u64 {
        self.entities.iter().map(|e| e.updated).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of the configured stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}
