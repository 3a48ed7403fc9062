//! Batch executor: applies one [`DiffBatch`] to the target.
//!
//! Rows are committed one at a time. A constraint violation or transform
//! error fails only that row; the rest of the batch proceeds. Transient
//! errors are retried under the run's [`RetryPolicy`] and, once exhausted,
//! abort the batch so the entity fails without advancing its cursor. Rows
//! committed before the abort are picked up as unchanged on resume.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conflict::{ConflictCandidate, ConflictRecord, ConflictResolver, Resolution};
use crate::diff::DiffBatch;
use crate::entity::{apply_refs, EntityDefinition, ResolvedRefs, Transform, TransformRegistry};
use crate::error::{MigrateError, Result};
use crate::mapping::{new_id_for, MappingRecord, MappingStore};
use crate::retry::{with_retry, RetryPolicy};
use crate::row::{Row, Value};
use crate::store::{TargetStore, UpsertOutcome};

/// A row deliberately not migrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub legacy_id: Option<i64>,
    pub reason: String,
}

/// A row whose migration failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub legacy_id: Option<i64>,
    pub error: String,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub skips: Vec<SkipRecord>,
    pub failures: Vec<RowFailure>,
    pub conflicts: Vec<ConflictRecord>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> u64 {
        self.inserted + self.updated
    }

    fn skip(&mut self, legacy_id: Option<i64>, reason: String) {
        self.skipped += 1;
        self.skips.push(SkipRecord { legacy_id, reason });
    }

    fn fail(&mut self, legacy_id: Option<i64>, error: String) {
        self.failed += 1;
        self.failures.push(RowFailure { legacy_id, error });
    }
}

/// Reference lookups for a batch: referenced entity -> legacy id -> new id.
#[derive(Debug, Default)]
pub(crate) struct RefIndex(HashMap<String, HashMap<i64, Uuid>>);

impl RefIndex {
    /// Resolve every referenced legacy id appearing in `rows` with one
    /// mapping lookup per referenced entity.
    pub(crate) async fn load<'r>(
        mapping: &dyn MappingStore,
        retry: &RetryPolicy,
        entity: &EntityDefinition,
        rows: impl Iterator<Item = &'r Row> + Clone,
    ) -> Result<Self> {
        let mut index = HashMap::new();
        for r in &entity.references {
            if index.contains_key(&r.entity) {
                continue;
            }
            let mut ids: Vec<i64> = entity
                .references
                .iter()
                .filter(|x| x.entity == r.entity)
                .flat_map(|x| rows.clone().filter_map(move |row| row.get_i64(&x.field)))
                .collect();
            ids.sort_unstable();
            ids.dedup();

            let resolved = if ids.is_empty() {
                HashMap::new()
            } else {
                let op = format!("resolve {} references", r.entity);
                with_retry(retry, &op, || mapping.lookup_many(&r.entity, &ids))
                    .await?
                    .into_iter()
                    .map(|(id, rec)| (id, rec.new_id))
                    .collect()
            };
            index.insert(r.entity.clone(), resolved);
        }
        Ok(Self(index))
    }

    fn get(&self, entity: &str, legacy_id: i64) -> Option<Uuid> {
        self.0.get(entity).and_then(|m| m.get(&legacy_id)).copied()
    }
}

/// Outcome of projecting a source row onto the target shape.
#[derive(Debug)]
pub(crate) enum Projection {
    Ready(Row),
    Unresolved(String),
}

/// Resolve references, run the transform and write resolved ids into the
/// result. Transform failures surface as [`MigrateError::Transform`].
pub(crate) fn project_row(
    entity: &EntityDefinition,
    transform: &dyn Transform,
    row: &Row,
    legacy_id: i64,
    index: &RefIndex,
) -> Result<Projection> {
    let mut refs = ResolvedRefs::default();
    for r in &entity.references {
        let resolved = row.get_i64(&r.field).and_then(|id| index.get(&r.entity, id));
        if resolved.is_none() && r.required {
            let shown = match row.get(&r.field) {
                None | Some(Value::Null) => "null".to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
            };
            return Ok(Projection::Unresolved(format!(
                "unresolved {} reference: {}",
                r.label(),
                shown
            )));
        }
        refs.insert(r.target_column(), resolved);
    }

    let mut out = transform
        .transform(row, &refs)
        .map_err(|e| MigrateError::Transform {
            entity: entity.name.clone(),
            legacy_id,
            message: e.to_string(),
        })?;
    apply_refs(&mut out, &refs);
    Ok(Projection::Ready(out))
}

/// Writes missing rows and settles conflict candidates.
#[derive(Clone)]
pub struct BatchExecutor {
    target: Arc<dyn TargetStore>,
    mapping: Arc<dyn MappingStore>,
    resolver: Arc<ConflictResolver>,
    transforms: TransformRegistry,
    retry: RetryPolicy,
}

impl BatchExecutor {
    pub fn new(
        target: Arc<dyn TargetStore>,
        mapping: Arc<dyn MappingStore>,
        resolver: Arc<ConflictResolver>,
        transforms: TransformRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            target,
            mapping,
            resolver,
            transforms,
            retry,
        }
    }

    /// Apply one batch. `Err` means the batch was aborted by a non-row-level
    /// failure and the entity must fail.
    pub async fn migrate_batch(&self, entity: &EntityDefinition, batch: &DiffBatch) -> Result<BatchOutcome> {
        let transform = self.transforms.resolve(entity)?;
        let rows = batch.missing.iter().chain(batch.candidates.iter().map(|c| &c.row));
        let index = RefIndex::load(self.mapping.as_ref(), &self.retry, entity, rows).await?;

        let mut outcome = BatchOutcome::default();

        for row in &batch.missing {
            let Some(legacy_id) = row.get_i64(&entity.key) else {
                outcome.fail(None, format!("missing or non-integer key field '{}'", entity.key));
                continue;
            };
            match self.insert_row(entity, transform.as_ref(), row, legacy_id, &index).await {
                Ok(RowResult::Written(UpsertOutcome::Inserted)) => outcome.inserted += 1,
                Ok(RowResult::Written(UpsertOutcome::Updated)) => outcome.updated += 1,
                Ok(RowResult::Skipped(reason)) => {
                    warn!("{} {}: skipped, {}", entity.name, legacy_id, reason);
                    outcome.skip(Some(legacy_id), reason);
                }
                Err(e) if e.is_row_level() => {
                    warn!("{} {}: row failed: {}", entity.name, legacy_id, e);
                    outcome.fail(Some(legacy_id), e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        for candidate in &batch.candidates {
            match self
                .settle_conflict(entity, transform.as_ref(), candidate, &index, &mut outcome)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_row_level() => {
                    warn!("{} {}: conflict update failed: {}", entity.name, candidate.legacy_id, e);
                    outcome.fail(Some(candidate.legacy_id), e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "{}: batch applied (inserted={}, updated={}, skipped={}, failed={}, unchanged={})",
            entity.name, outcome.inserted, outcome.updated, outcome.skipped, outcome.failed, batch.unchanged
        );
        Ok(outcome)
    }

    async fn insert_row(
        &self,
        entity: &EntityDefinition,
        transform: &dyn Transform,
        row: &Row,
        legacy_id: i64,
        index: &RefIndex,
    ) -> Result<RowResult> {
        let projected = match project_row(entity, transform, row, legacy_id, index)? {
            Projection::Ready(r) => r,
            Projection::Unresolved(reason) => return Ok(RowResult::Skipped(reason)),
        };
        let (_, written) = self
            .write(entity, legacy_id, new_id_for(&entity.name, legacy_id), &projected, row.content_hash())
            .await?;
        Ok(RowResult::Written(written))
    }

    async fn settle_conflict(
        &self,
        entity: &EntityDefinition,
        transform: &dyn Transform,
        candidate: &ConflictCandidate,
        index: &RefIndex,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let legacy_id = candidate.legacy_id;
        let resolution = self.resolver.resolve(&entity.name, candidate);

        let op = format!("fetch {} {}", entity.name, legacy_id);
        let old_values = with_retry(&self.retry, &op, || self.target.fetch(entity, legacy_id)).await?;

        let projection = match project_row(entity, transform, &candidate.row, legacy_id, index) {
            Ok(p) => Some(p),
            // Audit-only projection for strategies that do not write.
            Err(e) if e.is_row_level() && resolution != Resolution::Overwrite => None,
            Err(e) => return Err(e),
        };
        let changed_fields = match (&projection, &old_values) {
            (Some(Projection::Ready(new)), Some(old)) => new.changed_fields(old),
            (Some(Projection::Ready(new)), None) => new.iter().map(|(k, _)| k.clone()).collect(),
            _ => Vec::new(),
        };

        match resolution {
            Resolution::Overwrite => {
                let projected = match projection {
                    Some(Projection::Ready(r)) => r,
                    Some(Projection::Unresolved(reason)) => {
                        warn!("{} {}: conflict skipped, {}", entity.name, legacy_id, reason);
                        outcome.skip(Some(legacy_id), reason);
                        return Ok(());
                    }
                    None => return Ok(()),
                };
                let (new_id, written) = self
                    .write(entity, legacy_id, candidate.mapping.new_id, &projected, candidate.new_hash.clone())
                    .await?;
                match written {
                    UpsertOutcome::Inserted => outcome.inserted += 1,
                    UpsertOutcome::Updated => outcome.updated += 1,
                }
                outcome
                    .conflicts
                    .push(self.record(entity, candidate, new_id, old_values, changed_fields, resolution));
            }
            Resolution::KeepTarget => {
                let refreshed = MappingRecord::new(
                    &entity.name,
                    legacy_id,
                    candidate.mapping.new_id,
                    candidate.new_hash.clone(),
                );
                let op = format!("record mapping {} {}", entity.name, legacy_id);
                with_retry(&self.retry, &op, || self.mapping.record(&refreshed)).await?;
                outcome.skipped += 1;
                outcome.conflicts.push(self.record(
                    entity,
                    candidate,
                    candidate.mapping.new_id,
                    old_values,
                    changed_fields,
                    resolution,
                ));
            }
            Resolution::Defer => {
                warn!("{} {}: conflict deferred for manual resolution", entity.name, legacy_id);
                outcome.skip(Some(legacy_id), "conflict pending manual resolution".to_string());
                outcome.conflicts.push(self.record(
                    entity,
                    candidate,
                    candidate.mapping.new_id,
                    old_values,
                    changed_fields,
                    resolution,
                ));
            }
        }
        Ok(())
    }

    /// Upsert the target row then record the mapping, each under retry.
    async fn write(
        &self,
        entity: &EntityDefinition,
        legacy_id: i64,
        proposed_id: Uuid,
        projected: &Row,
        content_hash: String,
    ) -> Result<(Uuid, UpsertOutcome)> {
        let op = format!("upsert {} {}", entity.name, legacy_id);
        let (new_id, written) = with_retry(&self.retry, &op, || {
            self.target.upsert(entity, legacy_id, proposed_id, projected)
        })
        .await?;

        let record = MappingRecord::new(&entity.name, legacy_id, new_id, content_hash);
        let op = format!("record mapping {} {}", entity.name, legacy_id);
        with_retry(&self.retry, &op, || self.mapping.record(&record)).await?;
        Ok((new_id, written))
    }

    fn record(
        &self,
        entity: &EntityDefinition,
        candidate: &ConflictCandidate,
        new_id: Uuid,
        old_values: Option<Row>,
        changed_fields: Vec<String>,
        resolution: Resolution,
    ) -> ConflictRecord {
        ConflictRecord {
            entity: entity.name.clone(),
            legacy_id: candidate.legacy_id,
            new_id,
            old_values,
            new_values: candidate.row.clone(),
            changed_fields,
            strategy: self.resolver.strategy_for(&entity.name),
            outcome: resolution.outcome(),
            detected_at: chrono::Utc::now(),
        }
    }
}

enum RowResult {
    Written(UpsertOutcome),
    Skipped(String),
}
