//! Where run state lives between invocations.
//!
//! File, PostgreSQL and memory backends implement [`StateBackend`]; the
//! orchestrator only sees `Arc<dyn StateBackend>`. Status enums are stored as
//! their serde names, see [`RunStatus::as_str`] and [`TaskStatus::as_str`].

use async_trait::async_trait;
use std::str::FromStr;

use super::{RunState, RunStatus, TaskStatus};
use crate::error::{MigrateError, Result};

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Create tables or directories. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Whether [`StateBackend::init_schema`] has ever run against this
    /// store. An unprovisioned store holds no runs.
    async fn is_provisioned(&self) -> Result<bool> {
        Ok(true)
    }

    /// Persist a run, replacing any earlier save of the same run id.
    async fn save(&self, state: &RunState) -> Result<()>;

    async fn load(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Most recently started run recorded under `config_hash`.
    async fn load_latest(&self, config_hash: &str) -> Result<Option<RunState>>;

    fn backend_type(&self) -> &'static str;
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| MigrateError::State(format!("unknown run status '{}'", s)))
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| MigrateError::State(format!("unknown entity status '{}'", s)))
    }
}
