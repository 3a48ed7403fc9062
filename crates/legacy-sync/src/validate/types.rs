//! Type definitions for post-migration validation.

use serde::{Deserialize, Serialize};

use crate::entity::VolumeClass;

/// Kind of validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    CountParity,
    ReferentialIntegrity,
    Format,
    SampleStatistical,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckType::CountParity => "count_parity",
            CheckType::ReferentialIntegrity => "referential_integrity",
            CheckType::Format => "format",
            CheckType::SampleStatistical => "sample_statistical",
        };
        f.write_str(s)
    }
}

/// Outcome of a check, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    #[default]
    Pass,
    Warn,
    Fail,
    /// The check could not run (store error, invalid pattern).
    Error,
}

/// Result of one check on one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub entity: String,
    pub check: CheckType,
    pub expected: f64,
    pub actual: f64,
    pub outcome: ValidationOutcome,
    /// Bounded sample of offending legacy ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offending_keys: Vec<i64>,
    pub message: String,
}

impl ValidationResult {
    pub fn new(entity: &str, check: CheckType, expected: f64, actual: f64, outcome: ValidationOutcome) -> Self {
        Self {
            entity: entity.to_string(),
            check,
            expected,
            actual,
            outcome,
            offending_keys: Vec::new(),
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_offenders(mut self, keys: Vec<i64>) -> Self {
        self.offending_keys = keys;
        self
    }

    /// Result for a check that could not run.
    pub fn error(entity: &str, check: CheckType, message: impl Into<String>) -> Self {
        Self::new(entity, check, 0.0, 0.0, ValidationOutcome::Error).with_message(message)
    }
}

/// All check results of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn push(&mut self, result: ValidationResult) {
        self.results.push(result);
    }

    /// Worst outcome across all checks (`Pass` when empty).
    pub fn outcome(&self) -> ValidationOutcome {
        self.results
            .iter()
            .map(|r| r.outcome)
            .max()
            .unwrap_or_default()
    }

    /// Number of checks with the given outcome.
    pub fn count(&self, outcome: ValidationOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Results for one entity.
    pub fn for_entity<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a ValidationResult> + 'a {
        self.results.iter().filter(move |r| r.entity == entity)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Validation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Run validation after a migration run.
    pub enabled: bool,

    /// Allowed count-parity gap, in percent of the source count.
    pub tolerance_percent: f64,

    /// Rows sampled per entity for the statistical check.
    pub sample_size: usize,

    /// Confidence level for the mismatch-rate upper bound (0.90, 0.95, 0.99).
    pub confidence: f64,

    /// Highest acceptable mismatch-rate upper bound.
    pub max_mismatch_rate: f64,

    /// Smallest volume class that gets sampled.
    pub sample_min_volume: VolumeClass,

    /// RNG seed for sampling. Random (and reported) when unset.
    pub sample_seed: Option<u64>,

    /// Cap on offending keys listed per result.
    pub max_offending_keys: usize,

    /// Page size for format-check scans.
    pub scan_page_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance_percent: 0.0,
            sample_size: 400,
            confidence: 0.95,
            max_mismatch_rate: 0.01,
            sample_min_volume: VolumeClass::Large,
            sample_seed: None,
            max_offending_keys: 20,
            scan_page_size: 5000,
        }
    }
}
