//! Differential analysis: which source rows still need migrating.
//!
//! The mapping store's legacy ids are loaded once per entity into a
//! [`LegacyIdSet`]. Source rows are then pulled in key order, one bounded
//! batch at a time, and split into missing rows, conflict candidates (mapped
//! but with a different content hash) and unchanged rows. Stored hashes are
//! fetched only for the mapped ids of the current batch.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::conflict::ConflictCandidate;
use crate::entity::EntityDefinition;
use crate::error::Result;
use crate::mapping::MappingStore;
use crate::retry::{with_retry, RetryPolicy};
use crate::row::Row;
use crate::store::SourceStore;

/// Membership set over migrated legacy ids.
///
/// Dense id ranges use a bitset over `[min, max]`; sparse ones fall back to
/// a sorted vector searched by bisection.
#[derive(Debug, Clone)]
pub enum LegacyIdSet {
    Dense { min: i64, bits: Vec<u64>, len: usize },
    Sparse(Vec<i64>),
}

impl LegacyIdSet {
    /// Build from ids in any order. Duplicates are ignored.
    pub fn from_ids(mut ids: Vec<i64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        let (Some(&min), Some(&max)) = (ids.first(), ids.last()) else {
            return LegacyIdSet::Sparse(ids);
        };

        // Bitset wins while it takes no more than 8x the bytes of the array.
        let span = (max as i128 - min as i128 + 1) as u128;
        let bitset_bytes = span.div_ceil(8);
        let array_bytes = ids.len() as u128 * 8;
        if bitset_bytes > array_bytes * 8 {
            return LegacyIdSet::Sparse(ids);
        }

        let mut bits = vec![0u64; span.div_ceil(64) as usize];
        for id in &ids {
            let offset = (*id as i128 - min as i128) as usize;
            bits[offset / 64] |= 1u64 << (offset % 64);
        }
        LegacyIdSet::Dense {
            min,
            bits,
            len: ids.len(),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        match self {
            LegacyIdSet::Dense { min, bits, .. } => {
                let offset = id as i128 - *min as i128;
                if offset < 0 {
                    return false;
                }
                let offset = offset as u128;
                let word = (offset / 64) as usize;
                word < bits.len() && bits[word] & (1u64 << (offset % 64)) != 0
            }
            LegacyIdSet::Sparse(ids) => ids.binary_search(&id).is_ok(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LegacyIdSet::Dense { len, .. } => *len,
            LegacyIdSet::Sparse(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, LegacyIdSet::Dense { .. })
    }
}

/// One bounded slice of the entity's delta.
#[derive(Debug, Clone, Default)]
pub struct DiffBatch {
    /// Source rows read for this batch.
    pub rows_read: usize,
    /// Rows with no mapping record (including rows without a usable key).
    pub missing: Vec<Row>,
    /// Mapped rows whose content hash changed.
    pub candidates: Vec<ConflictCandidate>,
    /// Mapped rows whose content hash matches.
    pub unchanged: usize,
    /// Highest legacy id read; the cursor once this batch commits.
    pub last_key: Option<i64>,
}

impl DiffBatch {
    /// Whether the batch carries no work.
    pub fn is_noop(&self) -> bool {
        self.missing.is_empty() && self.candidates.is_empty()
    }
}

/// Whole-entity delta counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub source_rows: u64,
    pub missing: u64,
    pub conflict_candidates: u64,
    pub unchanged: u64,
}

/// Computes deltas between the source store and the mapping store.
#[derive(Clone)]
pub struct DifferentialAnalyzer {
    source: Arc<dyn SourceStore>,
    mapping: Arc<dyn MappingStore>,
    retry: RetryPolicy,
}

impl DifferentialAnalyzer {
    pub fn new(source: Arc<dyn SourceStore>, mapping: Arc<dyn MappingStore>, retry: RetryPolicy) -> Self {
        Self {
            source,
            mapping,
            retry,
        }
    }

    /// Load the membership set and open a lazy batch sequence starting
    /// after `resume_after`.
    pub async fn open(
        &self,
        entity: Arc<EntityDefinition>,
        resume_after: Option<i64>,
        batch_size: usize,
    ) -> Result<DiffCursor> {
        let op = format!("load mapped ids for {}", entity.name);
        let provisioned = with_retry(&self.retry, &op, || self.mapping.is_provisioned()).await?;
        let ids = if provisioned {
            with_retry(&self.retry, &op, || self.mapping.mapped_ids(&entity.name)).await?
        } else {
            debug!("{}: mapping table not created yet, every row is missing", entity.name);
            Vec::new()
        };
        let ids = LegacyIdSet::from_ids(ids);
        debug!(
            "{}: {} mapped ids ({})",
            entity.name,
            ids.len(),
            if ids.is_dense() { "bitset" } else { "sorted" }
        );

        Ok(DiffCursor {
            analyzer: self.clone(),
            entity,
            ids,
            cursor: resume_after,
            batch_size: batch_size.max(1),
            done: false,
        })
    }

    /// Scan the whole entity and count the delta without writing anything.
    pub async fn summarize(&self, entity: Arc<EntityDefinition>, batch_size: usize) -> Result<DiffSummary> {
        let mut cursor = self.open(entity, None, batch_size).await?;
        let mut summary = DiffSummary::default();
        while let Some(batch) = cursor.next_batch().await? {
            summary.source_rows += batch.rows_read as u64;
            summary.missing += batch.missing.len() as u64;
            summary.conflict_candidates += batch.candidates.len() as u64;
            summary.unchanged += batch.unchanged as u64;
        }
        Ok(summary)
    }
}

/// Pull-based sequence of [`DiffBatch`]es for one entity.
pub struct DiffCursor {
    analyzer: DifferentialAnalyzer,
    entity: Arc<EntityDefinition>,
    ids: LegacyIdSet,
    cursor: Option<i64>,
    batch_size: usize,
    done: bool,
}

impl DiffCursor {
    /// Number of legacy ids already mapped when the cursor was opened.
    pub fn mapped(&self) -> usize {
        self.ids.len()
    }

    /// Read and classify the next batch. `None` once the source is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<DiffBatch>> {
        if self.done {
            return Ok(None);
        }

        let a = &self.analyzer;
        let entity = &self.entity;
        let op = format!("fetch {} after {:?}", entity.name, self.cursor);
        let rows = with_retry(&a.retry, &op, || {
            a.source.fetch_after(entity, self.cursor, self.batch_size)
        })
        .await?;

        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if rows.len() < self.batch_size {
            self.done = true;
        }

        let mut batch = DiffBatch {
            rows_read: rows.len(),
            ..DiffBatch::default()
        };
        let mut mapped = Vec::new();
        for row in rows {
            match row.get_i64(&entity.key) {
                Some(id) => {
                    batch.last_key = Some(batch.last_key.map_or(id, |k: i64| k.max(id)));
                    if self.ids.contains(id) {
                        mapped.push((id, row));
                    } else {
                        batch.missing.push(row);
                    }
                }
                None => batch.missing.push(row),
            }
        }

        if !mapped.is_empty() {
            let keys: Vec<i64> = mapped.iter().map(|(id, _)| *id).collect();
            let op = format!("load hashes for {}", entity.name);
            let mut records =
                with_retry(&a.retry, &op, || a.mapping.lookup_many(&entity.name, &keys)).await?;
            for (id, row) in mapped {
                match records.remove(&id) {
                    Some(record) => {
                        let hash = row.content_hash();
                        if hash == record.content_hash {
                            batch.unchanged += 1;
                        } else {
                            batch.candidates.push(ConflictCandidate {
                                legacy_id: id,
                                row,
                                mapping: record,
                                new_hash: hash,
                            });
                        }
                    }
                    None => batch.missing.push(row),
                }
            }
        }

        match batch.last_key {
            Some(k) => self.cursor = Some(k),
            // No usable key: the cursor cannot move, so this is the last batch.
            None => self.done = true,
        }

        Ok(Some(batch))
    }
}
