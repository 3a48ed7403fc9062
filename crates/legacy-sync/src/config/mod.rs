//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::conflict::ConflictStrategy;
use crate::entity::{EntityCatalog, EntityDefinition};
use crate::error::Result;
use crate::graph::{DependencyGraph, ExecutionPlan};

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the settings that decide which rows land where.
    ///
    /// Connection settings, concurrency and retry tuning are left out so a
    /// run can be resumed against a moved database or with a different
    /// worker count.
    pub fn hash(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            entities: &'a [EntityDefinition],
            batch_sizes: &'a BatchSizes,
            conflict_strategy: ConflictStrategy,
        }

        let yaml = serde_yaml::to_string(&Fingerprint {
            entities: &self.entities,
            batch_sizes: &self.run.batch_sizes,
            conflict_strategy: self.run.conflict_strategy,
        })
        .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn catalog(&self) -> Result<EntityCatalog> {
        EntityCatalog::new(self.entities.clone())
    }

    /// Leveled plan for the configured entity selection. No I/O.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        DependencyGraph::build(&self.catalog()?, &self.run.entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
target:
  host: localhost
  database: clinic
  user: app
  ssl_mode: disable
run:
  concurrency: 2
  conflict_strategy: target_wins
  retry:
    max_attempts: 2
    initial_delay: 50ms
state:
  backend: memory
entities:
  - name: doctors
    source: legacy.tbl_doctor
    target: public.doctors
    depends_on: [offices]
    references:
      - field: office_id
        entity: offices
  - name: offices
    source: legacy.tbl_office
    target: public.offices
    volume: small
"#;

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.run.concurrency, Some(2));
        assert_eq!(config.run.conflict_strategy, ConflictStrategy::TargetWins);
        assert_eq!(config.run.retry.max_attempts, 2);
        assert_eq!(config.run.retry.initial_delay, std::time::Duration::from_millis(50));
        assert_eq!(config.state.backend, StateBackendKind::Memory);
        assert_eq!(config.target.as_ref().map(|t| t.port), Some(5432));
        assert!(config.source.is_none());
        assert_eq!(config.entities.len(), 2);
    }

    #[test]
    fn test_plan() {
        let config = Config::from_yaml(YAML).unwrap();
        let plan = config.plan().unwrap();
        assert_eq!(plan.levels(), &[vec!["offices".to_string()], vec!["doctors".to_string()]]);
    }

    #[test]
    fn test_hash_ignores_tuning() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.run.concurrency = Some(12);
        b.target = None;
        assert_eq!(a.hash(), b.hash());

        b.entities[1].batch_size = Some(10);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = Config::from_yaml("entities: [").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
