//! Post-migration validation.
//!
//! Four independent checks per entity: count parity, referential integrity,
//! format and statistical sampling. A check that cannot run yields an
//! `error` result instead of aborting the pass, and no validation outcome
//! ever changes the status of the run that produced the data.

mod sampling;
mod types;

pub use sampling::{mismatch_upper_bound, sample_ids, wilson_upper, z_for_confidence};
pub use types::{CheckType, ValidationConfig, ValidationOutcome, ValidationReport, ValidationResult};

use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::entity::{EntityCatalog, EntityDefinition, FormatCheckDef, ReferenceDef, TransformRegistry};
use crate::error::Result;
use crate::executor::{project_row, Projection, RefIndex};
use crate::mapping::MappingStore;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{SourceStore, TargetStore};

/// Runs validation checks against the stores.
pub struct Validator {
    catalog: Arc<EntityCatalog>,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    mapping: Arc<dyn MappingStore>,
    transforms: TransformRegistry,
    retry: RetryPolicy,
    config: ValidationConfig,
}

impl Validator {
    pub fn new(
        catalog: Arc<EntityCatalog>,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        mapping: Arc<dyn MappingStore>,
        transforms: TransformRegistry,
        retry: RetryPolicy,
        config: ValidationConfig,
    ) -> Self {
        Self {
            catalog,
            source,
            target,
            mapping,
            transforms,
            retry,
            config,
        }
    }

    /// Run every applicable check for the named entities, in order.
    pub async fn validate<'a>(&self, entities: impl IntoIterator<Item = &'a str>) -> ValidationReport {
        let mut report = ValidationReport::default();
        for name in entities {
            let Some(def) = self.catalog.get(name) else {
                warn!("validation skipped for unknown entity {}", name);
                continue;
            };
            self.validate_entity(def, &mut report).await;
        }
        info!(
            "Validation finished: {} checks, {} warn, {} fail, {} error",
            report.len(),
            report.count(ValidationOutcome::Warn),
            report.count(ValidationOutcome::Fail),
            report.count(ValidationOutcome::Error)
        );
        report
    }

    /// Run every applicable check for one entity.
    pub async fn validate_entity(&self, def: &EntityDefinition, report: &mut ValidationReport) {
        let result = self
            .count_parity(def)
            .await
            .unwrap_or_else(|e| ValidationResult::error(&def.name, CheckType::CountParity, e.to_string()));
        log_result(&result);
        report.push(result);

        for reference in &def.references {
            let result = self.referential_integrity(def, reference).await.unwrap_or_else(|e| {
                ValidationResult::error(&def.name, CheckType::ReferentialIntegrity, e.to_string())
            });
            log_result(&result);
            report.push(result);
        }

        for check in &def.format_checks {
            let result = self
                .format_check(def, check)
                .await
                .unwrap_or_else(|e| ValidationResult::error(&def.name, CheckType::Format, e.to_string()));
            log_result(&result);
            report.push(result);
        }

        if def.volume >= self.config.sample_min_volume {
            let result = self.sample_statistical(def).await.unwrap_or_else(|e| {
                ValidationResult::error(&def.name, CheckType::SampleStatistical, e.to_string())
            });
            log_result(&result);
            report.push(result);
        }
    }

    /// Source row count against mapped row count.
    pub async fn count_parity(&self, def: &EntityDefinition) -> Result<ValidationResult> {
        let op = format!("count {}", def.name);
        let source = with_retry(&self.retry, &op, || self.source.count(def)).await?;
        let mapped = with_retry(&self.retry, &op, || self.mapping.count(&def.name)).await?;

        let gap = source.abs_diff(mapped);
        let gap_percent = match source {
            0 if gap == 0 => 0.0,
            0 => 100.0,
            s => gap as f64 * 100.0 / s as f64,
        };

        let outcome = if gap_percent <= self.config.tolerance_percent {
            ValidationOutcome::Pass
        } else if def.critical {
            ValidationOutcome::Fail
        } else {
            ValidationOutcome::Warn
        };
        Ok(
            ValidationResult::new(&def.name, CheckType::CountParity, source as f64, mapped as f64, outcome)
                .with_message(format!(
                    "{} source rows, {} mapped ({:.2}% gap, tolerance {}%)",
                    source, mapped, gap_percent, self.config.tolerance_percent
                )),
        )
    }

    /// Every non-null reference column must point at an existing parent row.
    pub async fn referential_integrity(
        &self,
        def: &EntityDefinition,
        reference: &ReferenceDef,
    ) -> Result<ValidationResult> {
        let parent = self.catalog.require(&reference.entity, &def.name)?;
        let column = reference.target_column();
        let op = format!("scan {}.{} for orphans", def.name, column);
        let scan = with_retry(&self.retry, &op, || {
            self.target
                .find_orphans(def, column, parent, self.config.max_offending_keys)
        })
        .await?;

        let outcome = if scan.total == 0 {
            ValidationOutcome::Pass
        } else {
            ValidationOutcome::Fail
        };
        Ok(ValidationResult::new(
            &def.name,
            CheckType::ReferentialIntegrity,
            0.0,
            scan.total as f64,
            outcome,
        )
        .with_offenders(scan.sample.iter().map(|o| o.legacy_id).collect())
        .with_message(format!(
            "{} {} value(s) without a matching {} row",
            scan.total, column, parent.name
        )))
    }

    /// Every non-null value of the column must match the pattern.
    pub async fn format_check(&self, def: &EntityDefinition, check: &FormatCheckDef) -> Result<ValidationResult> {
        let pattern = match Regex::new(&check.pattern) {
            Ok(p) => p,
            Err(e) => {
                return Ok(ValidationResult::error(
                    &def.name,
                    CheckType::Format,
                    format!("invalid pattern for {}: {}", check.column, e),
                ))
            }
        };

        let mut offenders = Vec::new();
        let mut total: u64 = 0;
        let mut after = None;
        loop {
            let op = format!("scan {}.{}", def.name, check.column);
            let page = with_retry(&self.retry, &op, || {
                self.target
                    .scan_column(def, &check.column, after, self.config.scan_page_size.max(1))
            })
            .await?;
            let Some((last, _)) = page.last() else { break };
            let last = *last;
            for (legacy_id, value) in &page {
                if let Some(v) = value {
                    if !pattern.is_match(v) {
                        total += 1;
                        if offenders.len() < self.config.max_offending_keys {
                            offenders.push(*legacy_id);
                        }
                    }
                }
            }
            if page.len() < self.config.scan_page_size.max(1) {
                break;
            }
            after = Some(last);
        }

        let outcome = if total == 0 {
            ValidationOutcome::Pass
        } else {
            ValidationOutcome::Fail
        };
        let label = check.description.as_deref().unwrap_or(&check.pattern);
        Ok(
            ValidationResult::new(&def.name, CheckType::Format, 0.0, total as f64, outcome)
                .with_offenders(offenders)
                .with_message(format!("{} {} value(s) not matching {}", total, check.column, label)),
        )
    }

    /// Re-project a random sample of migrated rows and compare to the target.
    pub async fn sample_statistical(&self, def: &EntityDefinition) -> Result<ValidationResult> {
        let op = format!("load mapped ids for {}", def.name);
        let population = with_retry(&self.retry, &op, || self.mapping.mapped_ids(&def.name)).await?;
        if population.is_empty() {
            return Ok(ValidationResult::new(
                &def.name,
                CheckType::SampleStatistical,
                self.config.max_mismatch_rate,
                0.0,
                ValidationOutcome::Pass,
            )
            .with_message("no migrated rows to sample"));
        }

        let seed = self.config.sample_seed.unwrap_or_else(rand::random);
        let sample = sample_ids(&population, self.config.sample_size, seed);

        let op = format!("fetch {} sample", def.name);
        let rows = with_retry(&self.retry, &op, || self.source.fetch_by_ids(def, &sample)).await?;
        let index = RefIndex::load(self.mapping.as_ref(), &self.retry, def, rows.iter()).await?;
        let transform = self.transforms.resolve(def)?;

        let mut by_id: std::collections::HashMap<i64, _> = rows
            .into_iter()
            .filter_map(|r| r.get_i64(&def.key).map(|k| (k, r)))
            .collect();

        let mut mismatches = Vec::new();
        for &legacy_id in &sample {
            let matches = match by_id.remove(&legacy_id) {
                None => false,
                Some(row) => match project_row(def, transform.as_ref(), &row, legacy_id, &index) {
                    Ok(Projection::Ready(expected)) => {
                        let op = format!("fetch {} {}", def.name, legacy_id);
                        let actual =
                            with_retry(&self.retry, &op, || self.target.fetch(def, legacy_id)).await?;
                        actual.is_some_and(|a| expected.changed_fields(&a).is_empty())
                    }
                    Ok(Projection::Unresolved(_)) => false,
                    Err(e) if e.is_row_level() => false,
                    Err(e) => return Err(e),
                },
            };
            if !matches {
                mismatches.push(legacy_id);
            }
        }

        let upper = mismatch_upper_bound(
            mismatches.len(),
            sample.len(),
            population.len(),
            self.config.confidence,
        );
        let outcome = if upper > self.config.max_mismatch_rate {
            ValidationOutcome::Fail
        } else {
            ValidationOutcome::Pass
        };
        let total_mismatches = mismatches.len();
        mismatches.truncate(self.config.max_offending_keys);
        Ok(ValidationResult::new(
            &def.name,
            CheckType::SampleStatistical,
            self.config.max_mismatch_rate,
            upper,
            outcome,
        )
        .with_offenders(mismatches)
        .with_message(format!(
            "{} of {} sampled rows differ (population {}, seed {}); mismatch rate upper bound {:.4} at {:.0}% confidence",
            total_mismatches,
            sample.len(),
            population.len(),
            seed,
            upper,
            self.config.confidence * 100.0
        )))
    }
}

fn log_result(result: &ValidationResult) {
    match result.outcome {
        ValidationOutcome::Pass => info!("{} {}: pass - {}", result.entity, result.check, result.message),
        other => warn!("{} {}: {:?} - {}", result.entity, result.check, other, result.message),
    }
}
