//! Configuration validation.
//!
//! Everything here is checked before any store is touched, including the
//! dependency graph: a cycle is reported with zero I/O.

use super::{Config, DatabaseConfig, StateBackendKind};
use crate::entity::EntityCatalog;
use crate::error::{MigrateError, Result};
use crate::graph::DependencyGraph;
use crate::pg::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if let Some(source) = &config.source {
        validate_database("source", source)?;
    }
    if let Some(target) = &config.target {
        validate_database("target", target)?;
    }
    if let (Some(s), Some(t)) = (&config.source, &config.target) {
        if s.host == t.host && s.port == t.port && s.database == t.database {
            return Err(MigrateError::Config(
                "source and target cannot be the same database".into(),
            ));
        }
    }

    if config.state.backend == StateBackendKind::Postgres && config.target.is_none() {
        return Err(MigrateError::Config(
            "state.backend 'postgres' requires a target database".into(),
        ));
    }
    if config.state.backend == StateBackendKind::File && config.state.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("state.path is required for the file backend".into()));
    }

    let run = &config.run;
    if let Some(0) = run.concurrency {
        return Err(MigrateError::Config("run.concurrency must be at least 1".into()));
    }
    let sizes = &run.batch_sizes;
    if [sizes.small, sizes.medium, sizes.large, sizes.massive].contains(&0) {
        return Err(MigrateError::Config("run.batch_sizes must all be at least 1".into()));
    }
    if run.retry.max_attempts == 0 {
        return Err(MigrateError::Config("run.retry.max_attempts must be at least 1".into()));
    }
    if run.retry.operation_timeout.is_zero() {
        return Err(MigrateError::Config("run.retry.operation_timeout must be positive".into()));
    }

    let v = &config.validation;
    if v.tolerance_percent.is_nan() || v.tolerance_percent < 0.0 {
        return Err(MigrateError::Config("validation.tolerance_percent must be >= 0".into()));
    }
    if v.confidence.is_nan() || v.confidence <= 0.0 || v.confidence >= 1.0 {
        return Err(MigrateError::Config(format!(
            "validation.confidence must be between 0 and 1, got {}",
            v.confidence
        )));
    }
    if !(0.0..=1.0).contains(&v.max_mismatch_rate) {
        return Err(MigrateError::Config(
            "validation.max_mismatch_rate must be between 0 and 1".into(),
        ));
    }
    if v.scan_page_size == 0 {
        return Err(MigrateError::Config("validation.scan_page_size must be at least 1".into()));
    }

    if config.entities.is_empty() {
        return Err(MigrateError::Config("at least one entity must be defined".into()));
    }
    for entity in &config.entities {
        if let Some(0) = entity.batch_size {
            return Err(MigrateError::Config(format!(
                "entity '{}': batch_size must be at least 1",
                entity.name
            )));
        }
    }

    let catalog = EntityCatalog::new(config.entities.clone())?;
    DependencyGraph::build(&catalog, &run.entities)?;

    Ok(())
}

fn validate_database(role: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", role)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", role)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", role)));
    }
    if let Some(0) = db.max_connections {
        return Err(MigrateError::Config(format!("{}.max_connections must be at least 1", role)));
    }
    SslMode::parse(&db.ssl_mode)?;
    Ok(())
}
