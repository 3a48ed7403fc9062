//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

use crate::conflict::ConflictStrategy;
use crate::entity::{EntityDefinition, VolumeClass};
use crate::retry::RetryPolicy;
use crate::validate::ValidationConfig;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub total_memory_gb: f64,
    pub cpu_cores: usize,
}

impl SystemResources {
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Legacy database. Optional so plan-only and embedded runs need no
    /// connection settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DatabaseConfig>,

    /// Redesigned database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DatabaseConfig>,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    /// Entity definitions, in any order.
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
}

impl Config {
    /// Fill unset tuning values from the host's resources.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.run = self.run.with_auto_tuning(&resources);
        self
    }
}

/// PostgreSQL connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// `disable`, `require`, `verify-ca` or `verify-full`.
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Pool size. Derived from `run.concurrency` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Rows per batch for each volume class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSizes {
    /// Small entities go in one batch, capped at this many rows.
    pub small: usize,
    pub medium: usize,
    pub large: usize,
    pub massive: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            small: 10_000,
            medium: 2_000,
            large: 5_000,
            massive: 10_000,
        }
    }
}

impl BatchSizes {
    pub fn for_volume(&self, volume: VolumeClass) -> usize {
        match volume {
            VolumeClass::Small => self.small,
            VolumeClass::Medium => self.medium,
            VolumeClass::Large => self.large,
            VolumeClass::Massive => self.massive,
        }
    }

    /// Effective batch size: the entity override, else its volume class size.
    pub fn for_entity(&self, entity: &EntityDefinition) -> usize {
        entity
            .batch_size
            .unwrap_or_else(|| self.for_volume(entity.volume))
            .max(1)
    }
}

/// Run behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Entities to migrate. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,

    /// Entities migrated at once within a level. Auto-tuned from CPU count
    /// if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub batch_sizes: BatchSizes,

    /// Strategy for entities without their own.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Analyze only: no writes, no checkpoint movement.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RunConfig {
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Entities are I/O bound; one per core, at least 2 and at most 16.
        if self.concurrency.is_none() {
            self.concurrency = Some(resources.cpu_cores.clamp(2, 16));
        }
        info!("Auto-tuned config: concurrency={}", self.get_concurrency());
        self
    }

    pub fn get_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4).max(1)
    }

    /// Default pool size for a store serving this run.
    pub fn get_max_connections(&self, db: &DatabaseConfig) -> usize {
        db.max_connections
            .unwrap_or_else(|| (self.get_concurrency() * 2).clamp(4, 64))
    }
}

/// Where run state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// JSON file with HMAC integrity check.
    #[default]
    File,
    /// `_legacy_sync` tables in the target database.
    Postgres,
    /// Process-local; nothing survives the process.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendKind,

    /// State file for the `file` backend.
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::File,
            path: PathBuf::from(".legacy-sync-state.json"),
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_resolution() {
        let sizes = BatchSizes::default();
        let mut def = EntityDefinition::new("visits", "legacy.visits", "public.visits")
            .with_volume(VolumeClass::Large);
        assert_eq!(sizes.for_entity(&def), 5_000);
        def.batch_size = Some(250);
        assert_eq!(sizes.for_entity(&def), 250);
    }

    #[test]
    fn test_auto_tuning_respects_explicit_value() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 64,
        };
        let tuned = RunConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.concurrency, Some(16));

        let explicit = RunConfig {
            concurrency: Some(3),
            ..RunConfig::default()
        }
        .with_auto_tuning(&resources);
        assert_eq!(explicit.concurrency, Some(3));
    }

    #[test]
    fn test_pool_size_follows_concurrency() {
        let run = RunConfig {
            concurrency: Some(10),
            ..RunConfig::default()
        };
        let mut db = DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "app".into(),
            password: String::new(),
            ssl_mode: "disable".into(),
            max_connections: None,
        };
        assert_eq!(run.get_max_connections(&db), 20);
        db.max_connections = Some(5);
        assert_eq!(run.get_max_connections(&db), 5);
    }
}
