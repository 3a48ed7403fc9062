//! Source and target store abstractions.
//!
//! The orchestration core only talks to these traits. Bundled
//! implementations live in [`crate::memory`] and [`crate::pg`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityDefinition;
use crate::error::Result;
use crate::row::{Row, Value};

/// Whether an upsert created or replaced the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// A child row whose reference column points at no parent row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orphan {
    pub legacy_id: i64,
    pub value: Value,
}

/// Result of an orphan scan: total count plus a bounded sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanScan {
    pub total: u64,
    pub sample: Vec<Orphan>,
}

/// Read-only access to the legacy store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Number of rows in the entity's source location.
    async fn count(&self, entity: &EntityDefinition) -> Result<u64>;

    /// Up to `limit` rows with legacy id strictly greater than `after`,
    /// ordered by legacy id ascending.
    async fn fetch_after(&self, entity: &EntityDefinition, after: Option<i64>, limit: usize) -> Result<Vec<Row>>;

    /// Rows for the given legacy ids (missing ids are omitted).
    async fn fetch_by_ids(&self, entity: &EntityDefinition, legacy_ids: &[i64]) -> Result<Vec<Row>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    fn db_type(&self) -> &'static str;
}

/// Read/write access to the redesigned store.
///
/// Target rows carry `id` (the new UUID) and `legacy_id` in addition to
/// the transformed fields.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert the row under `new_id`, or update the row already holding
    /// `legacy_id` while keeping its existing id. Returns the effective id.
    async fn upsert(
        &self,
        entity: &EntityDefinition,
        legacy_id: i64,
        new_id: Uuid,
        row: &Row,
    ) -> Result<(Uuid, UpsertOutcome)>;

    /// Current target row for a legacy id.
    async fn fetch(&self, entity: &EntityDefinition, legacy_id: i64) -> Result<Option<Row>>;

    /// Number of rows in the entity's target location.
    async fn count(&self, entity: &EntityDefinition) -> Result<u64>;

    /// Rows of `child` whose non-null `column` matches no `id` in `parent`.
    async fn find_orphans(
        &self,
        child: &EntityDefinition,
        column: &str,
        parent: &EntityDefinition,
        limit: usize,
    ) -> Result<OrphanScan>;

    /// One page of `(legacy_id, column as text)` ordered by legacy id.
    async fn scan_column(
        &self,
        entity: &EntityDefinition,
        column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, Option<String>)>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    fn db_type(&self) -> &'static str;
}
