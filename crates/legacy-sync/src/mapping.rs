//! Legacy-id mapping store.
//!
//! The mapping table is the single durable record of which legacy ids have
//! been migrated, under which new id, and with which source content hash.
//! Only the batch executor writes to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// Namespace for deterministic new ids.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6761_6379_2d73_796e_632d_6964_7331);

/// Deterministic new id for `(entity, legacy_id)`.
///
/// A retried insert always proposes the same id, so a crash between the
/// target write and the mapping write cannot mint a second identity.
pub fn new_id_for(entity: &str, legacy_id: i64) -> Uuid {
    Uuid::new_v5(&ID_NAMESPACE, format!("{entity}:{legacy_id}").as_bytes())
}

/// One row of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub entity_type: String,
    pub legacy_id: i64,
    pub new_id: Uuid,
    /// SHA-256 hex of the last migrated source row.
    pub content_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

impl MappingRecord {
    pub fn new(entity: &str, legacy_id: i64, new_id: Uuid, content_hash: String) -> Self {
        Self {
            entity_type: entity.to_string(),
            legacy_id,
            new_id,
            content_hash,
            last_synced_at: Utc::now(),
        }
    }
}

/// Durable `(entity_type, legacy_id) -> new_id` store.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Create the backing table if needed.
    async fn init_schema(&self) -> Result<()>;

    /// Whether the backing table exists yet. A store that was never
    /// initialized holds no mappings.
    async fn is_provisioned(&self) -> Result<bool> {
        Ok(true)
    }

    /// Look up a single mapping.
    async fn lookup(&self, entity: &str, legacy_id: i64) -> Result<Option<MappingRecord>>;

    /// Look up many mappings at once. Missing ids are absent from the result.
    async fn lookup_many(&self, entity: &str, legacy_ids: &[i64]) -> Result<HashMap<i64, MappingRecord>>;

    /// All mapped legacy ids for an entity, in ascending order.
    async fn mapped_ids(&self, entity: &str) -> Result<Vec<i64>>;

    /// Number of mapped rows for an entity.
    async fn count(&self, entity: &str) -> Result<u64>;

    /// Insert or replace a mapping (keyed on entity and legacy id).
    async fn record(&self, record: &MappingRecord) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Process-local mapping store.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    records: RwLock<HashMap<String, BTreeMap<i64, MappingRecord>>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record for an entity, ordered by legacy id.
    pub async fn snapshot(&self, entity: &str) -> Vec<MappingRecord> {
        self.records
            .read()
            .await
            .get(entity)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn lookup(&self, entity: &str, legacy_id: i64) -> Result<Option<MappingRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(entity)
            .and_then(|m| m.get(&legacy_id))
            .cloned())
    }

    async fn lookup_many(&self, entity: &str, legacy_ids: &[i64]) -> Result<HashMap<i64, MappingRecord>> {
        let records = self.records.read().await;
        let Some(by_id) = records.get(entity) else {
            return Ok(HashMap::new());
        };
        Ok(legacy_ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn mapped_ids(&self, entity: &str) -> Result<Vec<i64>> {
        Ok(self
            .records
            .read()
            .await
            .get(entity)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn count(&self, entity: &str) -> Result<u64> {
        Ok(self
            .records
            .read()
            .await
            .get(entity)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    async fn record(&self, record: &MappingRecord) -> Result<()> {
        self.records
            .write()
            .await
            .entry(record.entity_type.clone())
            .or_default()
            .insert(record.legacy_id, record.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_deterministic() {
        assert_eq!(new_id_for("offices", 1), new_id_for("offices", 1));
        assert_ne!(new_id_for("offices", 1), new_id_for("offices", 2));
        assert_ne!(new_id_for("offices", 1), new_id_for("doctors", 1));
        assert_eq!(new_id_for("offices", 1).get_version_num(), 5);
    }

    #[tokio::test]
    async fn test_memory_store_record_and_lookup() {
        let store = MemoryMappingStore::new();
        for id in [3, 1, 2] {
            let rec = MappingRecord::new("offices", id, new_id_for("offices", id), format!("h{id}"));
            store.record(&rec).await.unwrap();
        }

        assert_eq!(store.count("offices").await.unwrap(), 3);
        assert_eq!(store.count("doctors").await.unwrap(), 0);
        assert_eq!(store.mapped_ids("offices").await.unwrap(), vec![1, 2, 3]);

        let found = store.lookup_many("offices", &[1, 3, 99]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&3].content_hash, "h3");

        assert!(store.lookup("offices", 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_record_replaces() {
        let store = MemoryMappingStore::new();
        let id = new_id_for("offices", 1);
        store
            .record(&MappingRecord::new("offices", 1, id, "old".into()))
            .await
            .unwrap();
        store
            .record(&MappingRecord::new("offices", 1, id, "new".into()))
            .await
            .unwrap();

        let snap = store.snapshot("offices").await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].content_hash, "new");
    }
}
