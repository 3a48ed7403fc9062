//! Conflict resolution for records that changed on the source after they
//! were migrated.
//!
//! The resolver only decides; the batch executor applies the decision. The
//! decision is a pure function of the strategy in force for the entity, so
//! the same candidate always resolves the same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entity::EntityDefinition;
use crate::mapping::MappingRecord;
use crate::row::Row;

/// How a conflict between source and target is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Overwrite the target with the current source values.
    #[default]
    SourceWins,
    /// Keep the target; refresh the stored hash so the row is not re-flagged.
    TargetWins,
    /// Record the conflict and leave the row for an operator.
    Manual,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictStrategy::SourceWins => "source_wins",
            ConflictStrategy::TargetWins => "target_wins",
            ConflictStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A source row whose legacy id is already mapped but whose content hash
/// no longer matches the mapping record.
#[derive(Debug, Clone)]
pub struct ConflictCandidate {
    pub legacy_id: i64,
    pub row: Row,
    pub mapping: MappingRecord,
    pub new_hash: String,
}

/// What the executor must do with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Transform the source row and upsert it over the target.
    Overwrite,
    /// Leave the target row as is and refresh the mapping hash.
    KeepTarget,
    /// Emit a conflict record and skip the row.
    Defer,
}

/// Applied outcome, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    SourceApplied,
    TargetKept,
    PendingManual,
}

/// Audit record for one resolved (or deferred) conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity: String,
    pub legacy_id: i64,
    pub new_id: Uuid,
    /// Target values before resolution, if the target row could be read.
    pub old_values: Option<Row>,
    /// Current source values.
    pub new_values: Row,
    /// Target fields whose value would change under `source_wins`.
    #[serde(default)]
    pub changed_fields: Vec<String>,
    pub strategy: ConflictStrategy,
    pub outcome: ConflictOutcome,
    pub detected_at: DateTime<Utc>,
}

/// Chooses a resolution per conflict candidate.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    default: ConflictStrategy,
    overrides: HashMap<String, ConflictStrategy>,
}

impl ConflictResolver {
    /// Create a resolver with a run-wide default strategy.
    pub fn new(default: ConflictStrategy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Build a resolver from the run default and the explicit per-entity
    /// overrides declared on the entity definitions.
    pub fn from_definitions<'a>(
        default: ConflictStrategy,
        definitions: impl IntoIterator<Item = &'a EntityDefinition>,
    ) -> Self {
        let overrides = definitions
            .into_iter()
            .filter_map(|d| d.conflict_strategy.map(|s| (d.name.clone(), s)))
            .collect();
        Self { default, overrides }
    }

    /// Strategy in force for an entity.
    pub fn strategy_for(&self, entity: &str) -> ConflictStrategy {
        self.overrides.get(entity).copied().unwrap_or(self.default)
    }

    /// Decide what to do with a candidate.
    pub fn resolve(&self, entity: &str, _candidate: &ConflictCandidate) -> Resolution {
        match self.strategy_for(entity) {
            ConflictStrategy::SourceWins => Resolution::Overwrite,
            ConflictStrategy::TargetWins => Resolution::KeepTarget,
            ConflictStrategy::Manual => Resolution::Defer,
        }
    }
}

impl Resolution {
    /// Outcome recorded once the resolution has been applied.
    pub fn outcome(self) -> ConflictOutcome {
        match self {
            Resolution::Overwrite => ConflictOutcome::SourceApplied,
            Resolution::KeepTarget => ConflictOutcome::TargetKept,
            Resolution::Defer => ConflictOutcome::PendingManual,
        }
    }
}
