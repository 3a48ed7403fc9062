//! Database-backed state storage for sync runs.
//!
//! Stores run state in PostgreSQL tables within the `_legacy_sync` schema,
//! next to the legacy-id mapping table. Preferred over file-based state for
//! production use: saves are transactional and several operators can
//! inspect the same run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::BTreeMap;
use tokio_postgres::types::Json;

use super::backend::StateBackend;
use super::{EntityCheckpoint, RunState};
use crate::conflict::ConflictRecord;
use crate::error::Result;

/// Schema holding sync bookkeeping tables.
pub(crate) const SYNC_SCHEMA: &str = "_legacy_sync";

/// PostgreSQL state backend.
pub struct DbStateBackend {
    pool: Pool,
    schema: String,
}

impl DbStateBackend {
    /// Create a new database state backend.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schema: SYNC_SCHEMA.to_string(),
        }
    }

    async fn load_run(&self, row: Option<tokio_postgres::Row>) -> Result<Option<RunState>> {
        let run_row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let run_id: String = run_row.get(0);
        let config_hash: String = run_row.get(1);
        let started_at: DateTime<Utc> = run_row.get(2);
        let completed_at: Option<DateTime<Utc>> = run_row.get(3);
        let status_str: String = run_row.get(4);
        let Json(pending_conflicts): Json<Vec<ConflictRecord>> = run_row.get(5);

        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT entity, status, cursor, processed, succeeded, failed, inserted,
                            updated, unchanged, skipped, conflicts, batches, error,
                            started_at, updated_at, completed_at
                     FROM {}.entity_checkpoints
                     WHERE run_id = $1",
                    self.schema
                ),
                &[&run_id],
            )
            .await?;

        let mut entities = BTreeMap::new();
        for row in rows {
            let entity: String = row.get(0);
            let status_str: String = row.get(1);
            let count = |i: usize| row.get::<_, i64>(i).max(0) as u64;
            entities.insert(
                entity,
                EntityCheckpoint {
                    status: status_str.parse()?,
                    cursor: row.get(2),
                    processed: count(3),
                    succeeded: count(4),
                    failed: count(5),
                    inserted: count(6),
                    updated: count(7),
                    unchanged: count(8),
                    skipped: count(9),
                    conflicts: count(10),
                    batches: count(11),
                    error: row.get(12),
                    started_at: row.get(13),
                    updated_at: row.get(14),
                    completed_at: row.get(15),
                },
            );
        }

        Ok(Some(RunState {
            run_id,
            config_hash,
            started_at,
            status: status_str.parse()?,
            entities,
            completed_at,
            pending_conflicts,
            hmac: None, // HMAC not used for database state
        }))
    }

    fn run_query(&self, filter: &str) -> String {
        format!(
            "SELECT run_id, config_hash, started_at, completed_at, status, pending_conflicts
             FROM {}.sync_runs
             WHERE {} = $1
             ORDER BY started_at DESC
             LIMIT 1",
            self.schema, filter
        )
    }
}

#[async_trait]
impl StateBackend for DbStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.sync_runs (
                    run_id TEXT PRIMARY KEY,
                    config_hash TEXT NOT NULL,
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'partial', 'failed', 'cancelled')),
                    pending_conflicts JSONB NOT NULL DEFAULT '[]'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.entity_checkpoints (
                    run_id TEXT NOT NULL REFERENCES {}.sync_runs(run_id) ON DELETE CASCADE,
                    entity TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'skipped')),
                    cursor BIGINT,
                    processed BIGINT NOT NULL DEFAULT 0,
                    succeeded BIGINT NOT NULL DEFAULT 0,
                    failed BIGINT NOT NULL DEFAULT 0,
                    inserted BIGINT NOT NULL DEFAULT 0,
                    updated BIGINT NOT NULL DEFAULT 0,
                    unchanged BIGINT NOT NULL DEFAULT 0,
                    skipped BIGINT NOT NULL DEFAULT 0,
                    conflicts BIGINT NOT NULL DEFAULT 0,
                    batches BIGINT NOT NULL DEFAULT 0,
                    error TEXT,
                    started_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    PRIMARY KEY (run_id, entity)
                )",
                self.schema, self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_sync_runs_latest
                    ON {}.sync_runs(config_hash, started_at DESC)",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn is_provisioned(&self) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "SELECT to_regclass($1::text) IS NOT NULL AND to_regclass($2::text) IS NOT NULL",
                &[
                    &format!("{}.sync_runs", self.schema),
                    &format!("{}.entity_checkpoints", self.schema),
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!(
                "INSERT INTO {}.sync_runs (run_id, config_hash, started_at, completed_at, status, pending_conflicts)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (run_id) DO UPDATE SET
                    completed_at = EXCLUDED.completed_at,
                    status = EXCLUDED.status,
                    pending_conflicts = EXCLUDED.pending_conflicts",
                self.schema
            ),
            &[
                &state.run_id,
                &state.config_hash,
                &state.started_at,
                &state.completed_at,
                &state.status.as_str(),
                &Json(&state.pending_conflicts),
            ],
        )
        .await?;

        let stmt = tx
            .prepare(&format!(
                "INSERT INTO {}.entity_checkpoints
                 (run_id, entity, status, cursor, processed, succeeded, failed, inserted, updated,
                  unchanged, skipped, conflicts, batches, error, started_at, updated_at, completed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                 ON CONFLICT (run_id, entity) DO UPDATE SET
                    status = EXCLUDED.status,
                    cursor = EXCLUDED.cursor,
                    processed = EXCLUDED.processed,
                    succeeded = EXCLUDED.succeeded,
                    failed = EXCLUDED.failed,
                    inserted = EXCLUDED.inserted,
                    updated = EXCLUDED.updated,
                    unchanged = EXCLUDED.unchanged,
                    skipped = EXCLUDED.skipped,
                    conflicts = EXCLUDED.conflicts,
                    batches = EXCLUDED.batches,
                    error = EXCLUDED.error,
                    started_at = EXCLUDED.started_at,
                    updated_at = EXCLUDED.updated_at,
                    completed_at = EXCLUDED.completed_at",
                self.schema
            ))
            .await?;

        for (entity, cp) in &state.entities {
            let counts = [
                cp.processed,
                cp.succeeded,
                cp.failed,
                cp.inserted,
                cp.updated,
                cp.unchanged,
                cp.skipped,
                cp.conflicts,
                cp.batches,
            ]
            .map(|c| c as i64);
            tx.execute(
                &stmt,
                &[
                    &state.run_id,
                    entity,
                    &cp.status.as_str(),
                    &cp.cursor,
                    &counts[0],
                    &counts[1],
                    &counts[2],
                    &counts[3],
                    &counts[4],
                    &counts[5],
                    &counts[6],
                    &counts[7],
                    &counts[8],
                    &cp.error,
                    &cp.started_at,
                    &cp.updated_at,
                    &cp.completed_at,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let row = {
            let conn = self.pool.get().await?;
            conn.query_opt(&self.run_query("run_id"), &[&run_id]).await?
        };
        self.load_run(row).await
    }

    async fn load_latest(&self, config_hash: &str) -> Result<Option<RunState>> {
        let row = {
            let conn = self.pool.get().await?;
            conn.query_opt(&self.run_query("config_hash"), &[&config_hash])
                .await?
        };
        self.load_run(row).await
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
