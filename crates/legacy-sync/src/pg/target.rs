//! Redesigned-schema writer.
//!
//! Target tables are expected to carry `id UUID PRIMARY KEY` and
//! `legacy_id BIGINT UNIQUE` next to the transformed columns.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::ident::{qualify, quote, split_location};
use crate::entity::EntityDefinition;
use crate::error::{MigrateError, Result};
use crate::row::Row;
use crate::store::{Orphan, OrphanScan, TargetStore, UpsertOutcome};

const ID_COLUMN: &str = "id";
const LEGACY_ID_COLUMN: &str = "legacy_id";

/// Upserts transformed rows keyed on `legacy_id`.
pub struct PgTarget {
    pool: Pool,
    columns: RwLock<HashMap<String, Arc<HashSet<String>>>>,
}

impl PgTarget {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            columns: RwLock::new(HashMap::new()),
        }
    }

    /// Column names of a target table, cached after the first lookup.
    async fn columns(&self, location: &str) -> Result<Arc<HashSet<String>>> {
        if let Some(cols) = self.columns.read().await.get(location) {
            return Ok(cols.clone());
        }

        let (schema, table) = split_location(location);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT column_name FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table],
            )
            .await?;
        if rows.is_empty() {
            return Err(MigrateError::Store(format!("target table {} does not exist", location)));
        }
        let cols: Arc<HashSet<String>> = Arc::new(rows.iter().map(|r| r.get::<_, String>(0)).collect());
        for required in [ID_COLUMN, LEGACY_ID_COLUMN] {
            if !cols.contains(required) {
                return Err(MigrateError::Store(format!(
                    "target table {} has no {} column",
                    location, required
                )));
            }
        }
        debug!("cached {} columns for {}", cols.len(), location);

        self.columns
            .write()
            .await
            .insert(location.to_string(), cols.clone());
        Ok(cols)
    }

    fn upsert_sql(table: &str, fields: &[&str]) -> Result<String> {
        let quoted: Vec<String> = fields.iter().map(|f| quote(f)).collect::<Result<_>>()?;
        let insert_cols = std::iter::once("id".to_string())
            .chain(std::iter::once("legacy_id".to_string()))
            .chain(quoted.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");
        let select_cols = std::iter::once("$1::uuid".to_string())
            .chain(std::iter::once("$2::bigint".to_string()))
            .chain(quoted.iter().map(|c| format!("r.{}", c)))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = if quoted.is_empty() {
            "legacy_id = EXCLUDED.legacy_id".to_string()
        } else {
            quoted
                .iter()
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Ok(format!(
            "INSERT INTO {table} AS t ({insert_cols})
             SELECT {select_cols} FROM jsonb_populate_record(NULL::{table}, $3::jsonb) r
             ON CONFLICT (legacy_id) DO UPDATE SET {updates}
             RETURNING t.id, (t.xmax = 0) AS inserted"
        ))
    }
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn upsert(
        &self,
        entity: &EntityDefinition,
        legacy_id: i64,
        new_id: Uuid,
        row: &Row,
    ) -> Result<(Uuid, UpsertOutcome)> {
        let columns = self.columns(&entity.target).await?;
        let mut fields = Vec::with_capacity(row.len());
        for (field, _) in row.iter() {
            if field == ID_COLUMN || field == LEGACY_ID_COLUMN {
                continue;
            }
            if !columns.contains(field.as_str()) {
                return Err(MigrateError::Transform {
                    entity: entity.name.clone(),
                    legacy_id,
                    message: format!("target {} has no column '{}'", entity.target, field),
                });
            }
            fields.push(field.as_str());
        }

        let sql = Self::upsert_sql(&qualify(&entity.target)?, &fields)?;
        let payload = row.to_json();
        let client = self.pool.get().await?;
        let result = client.query_one(&sql, &[&new_id, &legacy_id, &payload]).await?;

        let id: Uuid = result.get(0);
        let inserted: bool = result.get(1);
        let outcome = if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };
        Ok((id, outcome))
    }

    async fn fetch(&self, entity: &EntityDefinition, legacy_id: i64) -> Result<Option<Row>> {
        let sql = format!(
            "SELECT to_jsonb(t) FROM {} t WHERE t.legacy_id = $1",
            qualify(&entity.target)?
        );
        let client = self.pool.get().await?;
        let row = client.query_opt(&sql, &[&legacy_id]).await?;
        Ok(row.and_then(|r| Row::from_json(r.get::<_, Value>(0))))
    }

    async fn count(&self, entity: &EntityDefinition) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", qualify(&entity.target)?), &[])
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn find_orphans(
        &self,
        child: &EntityDefinition,
        column: &str,
        parent: &EntityDefinition,
        limit: usize,
    ) -> Result<OrphanScan> {
        let filter = format!(
            "FROM {child} c
             WHERE c.{col} IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id = c.{col})",
            child = qualify(&child.target)?,
            parent = qualify(&parent.target)?,
            col = quote(column)?
        );
        let client = self.pool.get().await?;

        let total: i64 = client
            .query_one(&format!("SELECT COUNT(*) {}", filter), &[])
            .await?
            .get(0);
        if total == 0 {
            return Ok(OrphanScan::default());
        }

        let rows = client
            .query(
                &format!(
                    "SELECT c.legacy_id, to_jsonb(c.{col}) {filter} ORDER BY c.legacy_id LIMIT $1",
                    col = quote(column)?,
                    filter = filter
                ),
                &[&(limit as i64)],
            )
            .await?;
        let sample = rows
            .iter()
            .map(|r| Orphan {
                legacy_id: r.get(0),
                value: r.get(1),
            })
            .collect();
        Ok(OrphanScan {
            total: total as u64,
            sample,
        })
    }

    async fn scan_column(
        &self,
        entity: &EntityDefinition,
        column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, Option<String>)>> {
        let sql = format!(
            "SELECT legacy_id, {col}::text FROM {table}
             WHERE ($1::bigint IS NULL OR legacy_id > $1)
             ORDER BY legacy_id
             LIMIT $2",
            col = quote(column)?,
            table = qualify(&entity.target)?
        );
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[&after, &(limit as i64)]).await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &'static str {
        "postgres"
    }
}
