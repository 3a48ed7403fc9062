//! # legacy-sync
//!
//! Dependency-ordered, resumable, differential migration of a legacy
//! relational schema into a redesigned one.
//!
//! - **Dependency ordering**: entities are leveled from their declared
//!   references; a child never runs before its parents.
//! - **Differential sync**: only rows missing from the legacy-id mapping, or
//!   whose content hash changed, are written.
//! - **Resume**: per-entity cursors are checkpointed after every committed
//!   batch, so an interrupted run picks up where it stopped.
//! - **Conflict handling**: `source_wins`, `target_wins` or `manual`, per
//!   entity.
//! - **Validation**: count parity, referential integrity, format checks and
//!   statistical sampling after the run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use legacy_sync::{Config, Orchestrator, TransformRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> legacy_sync::Result<()> {
//!     let config = Config::load("sync.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::connect(config, TransformRegistry::new()).await?;
//!     let report = orchestrator.run(CancellationToken::new()).await?;
//!     println!("{}: {} rows inserted", report.outcome, report.rows_inserted());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conflict;
pub mod diff;
pub mod entity;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod mapping;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod retry;
pub mod row;
pub mod state;
pub mod store;
pub mod validate;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, RunConfig, StateBackendKind, StateConfig};
pub use conflict::{ConflictOutcome, ConflictRecord, ConflictResolver, ConflictStrategy};
pub use diff::{DiffBatch, DiffSummary, DifferentialAnalyzer};
pub use entity::{
    EntityCatalog, EntityDefinition, FnTransform, IdentityTransform, ReferenceDef, ResolvedRefs, Transform,
    TransformError, TransformRegistry, VolumeClass,
};
pub use error::{ErrorKind, MigrateError, Result};
pub use event::RunEvent;
pub use executor::{BatchExecutor, BatchOutcome};
pub use graph::{DependencyGraph, ExecutionPlan};
pub use mapping::{MappingRecord, MappingStore, MemoryMappingStore};
pub use memory::{MemorySource, MemoryTarget};
pub use orchestrator::{EntityReport, HealthCheckResult, Orchestrator, RunOutcome, RunReport, Stores};
pub use retry::RetryPolicy;
pub use row::Row;
pub use state::{CheckpointManager, RunState, StateBackend, TaskStatus};
pub use store::{SourceStore, TargetStore};
pub use validate::{ValidationConfig, ValidationOutcome, ValidationReport, Validator};
