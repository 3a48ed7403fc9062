//! Legacy source reader.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::Value;

use super::ident::{qualify, quote};
use crate::entity::EntityDefinition;
use crate::error::{MigrateError, Result};
use crate::row::Row;
use crate::store::SourceStore;

/// Reads legacy tables as JSON rows, keyset-paginated on the entity key.
pub struct PgSource {
    pool: Pool,
}

impl PgSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn rows(entity: &EntityDefinition, rows: Vec<tokio_postgres::Row>) -> Result<Vec<Row>> {
        rows.into_iter()
            .map(|r| {
                let value: Value = r.get(0);
                Row::from_json(value).ok_or_else(|| {
                    MigrateError::Store(format!("{}: source row is not a JSON object", entity.source))
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn count(&self, entity: &EntityDefinition) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", qualify(&entity.source)?), &[])
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn fetch_after(&self, entity: &EntityDefinition, after: Option<i64>, limit: usize) -> Result<Vec<Row>> {
        let key = quote(&entity.key)?;
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t
             WHERE t.{key} IS NOT NULL AND ($1::bigint IS NULL OR t.{key} > $1)
             ORDER BY t.{key}
             LIMIT $2",
            table = qualify(&entity.source)?,
            key = key
        );
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[&after, &(limit as i64)]).await?;
        Self::rows(entity, rows)
    }

    async fn fetch_by_ids(&self, entity: &EntityDefinition, legacy_ids: &[i64]) -> Result<Vec<Row>> {
        if legacy_ids.is_empty() {
            return Ok(Vec::new());
        }
        let key = quote(&entity.key)?;
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.{key} = ANY($1) ORDER BY t.{key}",
            table = qualify(&entity.source)?,
            key = key
        );
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[&legacy_ids]).await?;
        Self::rows(entity, rows)
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
