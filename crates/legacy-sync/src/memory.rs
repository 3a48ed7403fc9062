//! In-memory source and target stores.
//!
//! Used for dry runs, tests and embedding the engine in another process.
//! Both stores are keyed by the entity's location (`source` / `target`),
//! not its name, mirroring how the database adapters address tables.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entity::EntityDefinition;
use crate::error::{MigrateError, Result};
use crate::row::{Row, Value};
use crate::store::{Orphan, OrphanScan, SourceStore, TargetStore, UpsertOutcome};

/// Legacy rows held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add rows to a source location.
    pub fn with_rows(mut self, location: &str, rows: impl IntoIterator<Item = Row>) -> Self {
        self.tables
            .get_mut()
            .entry(location.to_string())
            .or_default()
            .extend(rows);
        self
    }

    /// Append rows to a source location.
    pub async fn insert_rows(&self, location: &str, rows: impl IntoIterator<Item = Row>) {
        self.tables
            .write()
            .await
            .entry(location.to_string())
            .or_default()
            .extend(rows);
    }

    /// Replace the row whose key field equals `legacy_id`. Returns false if absent.
    pub async fn update_row(&self, location: &str, key: &str, legacy_id: i64, row: Row) -> bool {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(location) else {
            return false;
        };
        match rows.iter_mut().find(|r| r.get_i64(key) == Some(legacy_id)) {
            Some(slot) => {
                *slot = row;
                true
            }
            None => false,
        }
    }

    /// Rows with a valid key, sorted by key.
    async fn keyed(&self, entity: &EntityDefinition) -> Vec<(i64, Row)> {
        let tables = self.tables.read().await;
        let mut rows: Vec<(i64, Row)> = tables
            .get(&entity.source)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get_i64(&entity.key).map(|k| (k, r.clone())))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|(k, _)| *k);
        rows
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn count(&self, entity: &EntityDefinition) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .await
            .get(&entity.source)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn fetch_after(&self, entity: &EntityDefinition, after: Option<i64>, limit: usize) -> Result<Vec<Row>> {
        Ok(self
            .keyed(entity)
            .await
            .into_iter()
            .filter(|(k, _)| after.map_or(true, |a| *k > a))
            .take(limit)
            .map(|(_, r)| r)
            .collect())
    }

    async fn fetch_by_ids(&self, entity: &EntityDefinition, legacy_ids: &[i64]) -> Result<Vec<Row>> {
        let wanted: HashSet<i64> = legacy_ids.iter().copied().collect();
        Ok(self
            .keyed(entity)
            .await
            .into_iter()
            .filter(|(k, _)| wanted.contains(k))
            .map(|(_, r)| r)
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &'static str {
        "memory"
    }
}

/// Redesigned-schema rows held in memory, keyed by legacy id.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    tables: RwLock<HashMap<String, BTreeMap<i64, Row>>>,
    not_null: HashMap<String, Vec<String>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: reject upserts into `location` where `column` is null or absent.
    pub fn require_column(mut self, location: &str, column: &str) -> Self {
        self.not_null
            .entry(location.to_string())
            .or_default()
            .push(column.to_string());
        self
    }

    /// Copy of every row in a target location, ordered by legacy id.
    pub async fn rows(&self, location: &str) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(location)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite a field of an existing target row (simulates edits made on
    /// the target side). Returns false if the row does not exist.
    pub async fn set_field(&self, location: &str, legacy_id: i64, field: &str, value: Value) -> bool {
        let mut tables = self.tables.write().await;
        match tables.get_mut(location).and_then(|t| t.get_mut(&legacy_id)) {
            Some(row) => {
                row.insert(field, value);
                true
            }
            None => false,
        }
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn upsert(
        &self,
        entity: &EntityDefinition,
        legacy_id: i64,
        new_id: Uuid,
        row: &Row,
    ) -> Result<(Uuid, UpsertOutcome)> {
        if let Some(columns) = self.not_null.get(&entity.target) {
            if let Some(col) = columns.iter().find(|c| row.is_null(c)) {
                return Err(MigrateError::Constraint(format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    col, entity.target
                )));
            }
        }

        let mut tables = self.tables.write().await;
        let table = tables.entry(entity.target.clone()).or_default();

        let (id, outcome) = match table.get(&legacy_id).and_then(|r| r.get("id")) {
            Some(Value::String(existing)) => {
                let id = Uuid::parse_str(existing).map_err(|e| MigrateError::Store(e.to_string()))?;
                (id, UpsertOutcome::Updated)
            }
            _ => (new_id, UpsertOutcome::Inserted),
        };

        let mut stored = row.clone();
        stored.insert("id", id.to_string());
        stored.insert("legacy_id", legacy_id);
        table.insert(legacy_id, stored);
        Ok((id, outcome))
    }

    async fn fetch(&self, entity: &EntityDefinition, legacy_id: i64) -> Result<Option<Row>> {
        Ok(self
            .tables
            .read()
            .await
            .get(&entity.target)
            .and_then(|t| t.get(&legacy_id))
            .cloned())
    }

    async fn count(&self, entity: &EntityDefinition) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .await
            .get(&entity.target)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }

    async fn find_orphans(
        &self,
        child: &EntityDefinition,
        column: &str,
        parent: &EntityDefinition,
        limit: usize,
    ) -> Result<OrphanScan> {
        let tables = self.tables.read().await;
        let parent_ids: HashSet<String> = tables
            .get(&parent.target)
            .map(|t| t.values().filter_map(|r| r.get("id").and_then(render)).collect())
            .unwrap_or_default();

        let mut scan = OrphanScan::default();
        if let Some(rows) = tables.get(&child.target) {
            for (legacy_id, row) in rows {
                let Some(value) = row.get(column) else { continue };
                let Some(text) = render(value) else { continue };
                if !parent_ids.contains(&text) {
                    scan.total += 1;
                    if scan.sample.len() < limit {
                        scan.sample.push(Orphan {
                            legacy_id: *legacy_id,
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        Ok(scan)
    }

    async fn scan_column(
        &self,
        entity: &EntityDefinition,
        column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, Option<String>)>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(&entity.target) else {
            return Ok(Vec::new());
        };
        let start = after.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Excluded);
        Ok(rows
            .range((start, std::ops::Bound::Unbounded))
            .take(limit)
            .map(|(id, row)| (*id, row.get(column).and_then(render)))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &'static str {
        "memory"
    }
}
