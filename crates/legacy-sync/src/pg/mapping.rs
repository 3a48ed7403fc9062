//! Mapping table in the `_legacy_sync` schema.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::mapping::{MappingRecord, MappingStore};
use crate::state::SYNC_SCHEMA;

/// PostgreSQL mapping store.
///
/// Reads never create the table: until [`MappingStore::init_schema`] has
/// run, every read path sees an empty mapping.
pub struct PgMappingStore {
    pool: Pool,
    table: String,
    provisioned: AtomicBool,
}

impl PgMappingStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            table: format!("{}.id_mapping", SYNC_SCHEMA),
            provisioned: AtomicBool::new(false),
        }
    }

    /// Check for the table with `to_regclass`. Once seen it is assumed to
    /// stay.
    async fn table_present(&self, client: &deadpool_postgres::Client) -> Result<bool> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(true);
        }
        let row = client
            .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&self.table])
            .await?;
        let present: bool = row.get(0);
        if present {
            self.provisioned.store(true, Ordering::Release);
        }
        Ok(present)
    }

    fn record_from_row(row: &tokio_postgres::Row) -> MappingRecord {
        MappingRecord {
            entity_type: row.get(0),
            legacy_id: row.get(1),
            new_id: row.get(2),
            content_hash: row.get(3),
            last_synced_at: row.get(4),
        }
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                     entity_type TEXT NOT NULL,
                     legacy_id BIGINT NOT NULL,
                     new_id UUID NOT NULL,
                     content_hash TEXT NOT NULL,
                     last_synced_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                     PRIMARY KEY (entity_type, legacy_id)
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_id_mapping_new_id ON {table}(new_id);",
                schema = SYNC_SCHEMA,
                table = self.table
            ))
            .await?;
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_provisioned(&self) -> Result<bool> {
        let client = self.pool.get().await?;
        self.table_present(&client).await
    }

    async fn lookup(&self, entity: &str, legacy_id: i64) -> Result<Option<MappingRecord>> {
        let client = self.pool.get().await?;
        if !self.table_present(&client).await? {
            return Ok(None);
        }
        let row = client
            .query_opt(
                &format!(
                    "SELECT entity_type, legacy_id, new_id, content_hash, last_synced_at
                     FROM {} WHERE entity_type = $1 AND legacy_id = $2",
                    self.table
                ),
                &[&entity, &legacy_id],
            )
            .await?;
        Ok(row.as_ref().map(Self::record_from_row))
    }

    async fn lookup_many(&self, entity: &str, legacy_ids: &[i64]) -> Result<HashMap<i64, MappingRecord>> {
        if legacy_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.pool.get().await?;
        if !self.table_present(&client).await? {
            return Ok(HashMap::new());
        }
        let rows = client
            .query(
                &format!(
                    "SELECT entity_type, legacy_id, new_id, content_hash, last_synced_at
                     FROM {} WHERE entity_type = $1 AND legacy_id = ANY($2)",
                    self.table
                ),
                &[&entity, &legacy_ids],
            )
            .await?;
        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .map(|r| (r.legacy_id, r))
            .collect())
    }

    async fn mapped_ids(&self, entity: &str) -> Result<Vec<i64>> {
        let client = self.pool.get().await?;
        if !self.table_present(&client).await? {
            return Ok(Vec::new());
        }
        let rows = client
            .query(
                &format!(
                    "SELECT legacy_id FROM {} WHERE entity_type = $1 ORDER BY legacy_id",
                    self.table
                ),
                &[&entity],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn count(&self, entity: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        if !self.table_present(&client).await? {
            return Ok(0);
        }
        let row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM {} WHERE entity_type = $1", self.table),
                &[&entity],
            )
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn record(&self, record: &MappingRecord) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (entity_type, legacy_id, new_id, content_hash, last_synced_at)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (entity_type, legacy_id) DO UPDATE SET
                        new_id = EXCLUDED.new_id,
                        content_hash = EXCLUDED.content_hash,
                        last_synced_at = EXCLUDED.last_synced_at",
                    self.table
                ),
                &[
                    &record.entity_type,
                    &record.legacy_id,
                    &record.new_id,
                    &record.content_hash,
                    &record.last_synced_at,
                ],
            )
            .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
