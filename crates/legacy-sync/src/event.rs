//! Run events streamed to reporting collaborators.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::conflict::{ConflictOutcome, ConflictStrategy};
use crate::state::TaskStatus;
use crate::validate::ValidationOutcome;

/// Progress notification emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        entities: usize,
        levels: usize,
        resumed: bool,
    },
    LevelStarted {
        level: usize,
        entities: Vec<String>,
    },
    EntityStarted {
        entity: String,
        level: usize,
        resume_from: Option<i64>,
    },
    BatchCommitted {
        entity: String,
        batch: u64,
        cursor: Option<i64>,
        inserted: u64,
        updated: u64,
        skipped: u64,
        failed: u64,
    },
    RowSkipped {
        entity: String,
        legacy_id: Option<i64>,
        reason: String,
    },
    ConflictDetected {
        entity: String,
        legacy_id: i64,
        strategy: ConflictStrategy,
        outcome: ConflictOutcome,
    },
    EntityFinished {
        entity: String,
        status: TaskStatus,
        error: Option<String>,
    },
    LevelFinished {
        level: usize,
    },
    ValidationFinished {
        checks: usize,
        outcome: ValidationOutcome,
    },
    RunFinished {
        run_id: String,
        outcome: String,
    },
}

/// Optional event sink. Sending never blocks and a closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink(Option<mpsc::UnboundedSender<RunEvent>>);

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self(Some(tx))
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
