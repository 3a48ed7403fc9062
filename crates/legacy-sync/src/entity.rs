//! Entity definitions, the entity catalog and the transform registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::conflict::ConflictStrategy;
use crate::error::{MigrateError, Result};
use crate::row::{Row, Value};

/// Expected size of an entity; selects the default batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeClass {
    Small,
    #[default]
    Medium,
    Large,
    Massive,
}

/// A foreign-key-shaped source field resolved through the mapping store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDef {
    /// Source field holding the referenced legacy id.
    pub field: String,
    /// Referenced entity name.
    pub entity: String,
    /// Rows with an unresolved required reference are skipped.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Target column receiving the resolved id (defaults to `field`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
}

impl ReferenceDef {
    /// Column the resolved new id is written to.
    pub fn target_column(&self) -> &str {
        self.target_column.as_deref().unwrap_or(&self.field)
    }

    /// Human label used in skip reasons: `office_id` becomes `office`.
    pub fn label(&self) -> &str {
        self.field.strip_suffix("_id").unwrap_or(&self.field)
    }
}

/// Regex check applied to a target column during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatCheckDef {
    pub column: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Static descriptor of one migrated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Entity name, unique within the catalog.
    pub name: String,

    /// Source location (`schema.table`).
    pub source: String,

    /// Target location (`schema.table`).
    pub target: String,

    /// Entities that must be migrated first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Registered transform name. `None` copies fields through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    /// Expected volume class.
    #[serde(default)]
    pub volume: VolumeClass,

    /// Idempotency key: the source field holding the legacy id.
    #[serde(default = "default_key")]
    pub key: String,

    /// Foreign-key-shaped fields.
    #[serde(default)]
    pub references: Vec<ReferenceDef>,

    /// Count-parity gaps fail (rather than warn) for critical entities.
    #[serde(default)]
    pub critical: bool,

    /// Explicit conflict strategy for this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_strategy: Option<ConflictStrategy>,

    /// Batch size override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Format checks run by the validator.
    #[serde(default)]
    pub format_checks: Vec<FormatCheckDef>,
}

impl EntityDefinition {
    /// Minimal definition, mostly useful in tests and embedding code.
    pub fn new(name: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            depends_on: Vec::new(),
            transform: None,
            volume: VolumeClass::default(),
            key: default_key(),
            references: Vec::new(),
            critical: false,
            conflict_strategy: None,
            batch_size: None,
            format_checks: Vec::new(),
        }
    }

    /// Add a required reference and the matching dependency.
    pub fn with_reference(mut self, field: impl Into<String>, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        if !self.depends_on.contains(&entity) {
            self.depends_on.push(entity.clone());
        }
        self.references.push(ReferenceDef {
            field: field.into(),
            entity,
            required: true,
            target_column: None,
        });
        self
    }

    /// Set the volume class.
    pub fn with_volume(mut self, volume: VolumeClass) -> Self {
        self.volume = volume;
        self
    }
}

/// Resolved references for one row, keyed by target column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRefs(BTreeMap<String, Option<Uuid>>);

impl ResolvedRefs {
    pub fn insert(&mut self, column: impl Into<String>, id: Option<Uuid>) {
        self.0.insert(column.into(), id);
    }

    pub fn get(&self, column: &str) -> Option<Uuid> {
        self.0.get(column).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Uuid>)> {
        self.0.iter()
    }
}

/// Error raised by a transform for invalid source data.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Per-entity mapping from a source row to target fields.
///
/// Implementations must be pure: no I/O, no side effects. Resolved reference
/// columns are written into the output by the executor after the transform
/// runs, so transforms only need them when a value depends on one.
pub trait Transform: Send + Sync {
    fn transform(&self, source: &Row, refs: &ResolvedRefs) -> std::result::Result<Row, TransformError>;
}

/// Copies source fields through, minus excluded fields, with optional renames.
#[derive(Debug, Clone, Default)]
pub struct IdentityTransform {
    exclude: BTreeSet<String>,
    renames: BTreeMap<String, String>,
}

impl IdentityTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default transform for a definition: drops the key field and the raw
    /// reference fields (the executor writes resolved ids in their place).
    pub fn for_entity(def: &EntityDefinition) -> Self {
        let mut t = Self::new().excluding([def.key.as_str()]);
        for r in &def.references {
            t.exclude.insert(r.field.clone());
        }
        t
    }

    pub fn excluding<'a>(mut self, fields: impl IntoIterator<Item = &'a str>) -> Self {
        self.exclude.extend(fields.into_iter().map(str::to_string));
        self
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.insert(from.into(), to.into());
        self
    }
}

impl Transform for IdentityTransform {
    fn transform(&self, source: &Row, _refs: &ResolvedRefs) -> std::result::Result<Row, TransformError> {
        Ok(source
            .iter()
            .filter(|(k, _)| !self.exclude.contains(*k))
            .map(|(k, v)| {
                let name = self.renames.get(k).unwrap_or(k).clone();
                (name, v.clone())
            })
            .collect())
    }
}

/// Adapter turning a closure into a [`Transform`].
pub struct FnTransform<F>(pub F);

impl<F> Transform for FnTransform<F>
where
    F: Fn(&Row, &ResolvedRefs) -> std::result::Result<Row, TransformError> + Send + Sync,
{
    fn transform(&self, source: &Row, refs: &ResolvedRefs) -> std::result::Result<Row, TransformError> {
        (self.0)(source, refs)
    }
}

/// Named transforms supplied by the embedding application.
#[derive(Default, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform under a name.
    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform + 'static) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, transform: impl Transform + 'static) -> Self {
        self.register(name, transform);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Transform to use for a definition.
    pub fn resolve(&self, def: &EntityDefinition) -> Result<Arc<dyn Transform>> {
        match &def.transform {
            None => Ok(Arc::new(IdentityTransform::for_entity(def))),
            Some(name) => self.transforms.get(name).cloned().ok_or_else(|| {
                MigrateError::Config(format!(
                    "entity '{}' uses unregistered transform '{}'",
                    def.name, name
                ))
            }),
        }
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry").field("transforms", &names).finish()
    }
}

/// Validated, immutable set of entity definitions for one run.
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    entities: BTreeMap<String, Arc<EntityDefinition>>,
}

impl EntityCatalog {
    /// Build a catalog, rejecting duplicate names, empty keys and references
    /// to entities that are not declared dependencies.
    pub fn new(definitions: Vec<EntityDefinition>) -> Result<Self> {
        let mut entities = BTreeMap::new();
        for def in definitions {
            if def.name.is_empty() {
                return Err(MigrateError::Config("entity name cannot be empty".into()));
            }
            if def.key.is_empty() {
                return Err(MigrateError::Config(format!(
                    "entity '{}' has an empty idempotency key",
                    def.name
                )));
            }
            for r in &def.references {
                if !def.depends_on.contains(&r.entity) {
                    return Err(MigrateError::Config(format!(
                        "entity '{}' references '{}' through '{}' but does not depend on it",
                        def.name, r.entity, r.field
                    )));
                }
            }
            let name = def.name.clone();
            if entities.insert(name.clone(), Arc::new(def)).is_some() {
                return Err(MigrateError::Config(format!(
                    "entity '{}' is defined more than once",
                    name
                )));
            }
        }
        Ok(Self { entities })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityDefinition>> {
        self.entities.get(name)
    }

    /// Like [`get`](Self::get) but reports an unknown entity.
    pub fn require(&self, name: &str, referenced_by: &str) -> Result<&Arc<EntityDefinition>> {
        self.entities.get(name).ok_or_else(|| MigrateError::UnknownEntity {
            entity: name.to_string(),
            referenced_by: referenced_by.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDefinition>> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Write resolved reference ids into a transformed row.
pub(crate) fn apply_refs(row: &mut Row, refs: &ResolvedRefs) {
    for (column, id) in refs.iter() {
        let value = match id {
            Some(id) => Value::String(id.to_string()),
            None => Value::Null,
        };
        row.insert(column.clone(), value);
    }
}

fn default_key() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doctors() -> EntityDefinition {
        EntityDefinition::new("doctors", "legacy.doctors", "public.doctors")
            .with_reference("office_id", "offices")
    }

    #[test]
    fn test_definition_defaults_from_yaml() {
        let def: EntityDefinition = serde_yaml::from_str(
            r#"
name: doctors
source: legacy.doctors
target: public.doctors
depends_on: [offices]
references:
  - field: office_id
    entity: offices
"#,
        )
        .unwrap();
        assert_eq!(def.key, "id");
        assert_eq!(def.volume, VolumeClass::Medium);
        assert!(def.references[0].required);
        assert_eq!(def.references[0].target_column(), "office_id");
        assert_eq!(def.references[0].label(), "office");
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let a = EntityDefinition::new("offices", "legacy.offices", "public.offices");
        let err = EntityCatalog::new(vec![a.clone(), a]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_catalog_rejects_undeclared_reference() {
        let mut def = doctors();
        def.depends_on.clear();
        let err = EntityCatalog::new(vec![def]).unwrap_err();
        assert!(err.to_string().contains("does not depend on it"));
    }

    #[test]
    fn test_identity_transform_for_entity() {
        let def = doctors();
        let t = IdentityTransform::for_entity(&def);
        let src = Row::from_json(json!({"id": 1, "name": "Dr. Ames", "office_id": 2})).unwrap();
        let out = t.transform(&src, &ResolvedRefs::default()).unwrap();
        assert_eq!(out, Row::from_json(json!({"name": "Dr. Ames"})).unwrap());
    }

    #[test]
    fn test_identity_transform_rename() {
        let t = IdentityTransform::new().rename("nm", "name");
        let src = Row::from_json(json!({"nm": "x"})).unwrap();
        let out = t.transform(&src, &ResolvedRefs::default()).unwrap();
        assert_eq!(out.get("name"), Some(&json!("x")));
    }

    #[test]
    fn test_registry_resolve() {
        let registry = TransformRegistry::new().with(
            "upper",
            FnTransform(|row: &Row, _: &ResolvedRefs| {
                let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                let mut out = Row::new();
                out.insert("name", name.to_uppercase());
                Ok(out)
            }),
        );
        let mut def = doctors();
        assert!(registry.resolve(&def).is_ok());

        def.transform = Some("upper".into());
        let t = registry.resolve(&def).unwrap();
        let out = t
            .transform(&Row::from_json(json!({"name": "ames"})).unwrap(), &ResolvedRefs::default())
            .unwrap();
        assert_eq!(out.get("name"), Some(&json!("AMES")));

        def.transform = Some("missing".into());
        assert!(registry.resolve(&def).is_err());
    }

    #[test]
    fn test_apply_refs() {
        let mut row = Row::new();
        let mut refs = ResolvedRefs::default();
        let id = Uuid::new_v4();
        refs.insert("office_id", Some(id));
        refs.insert("backup_office_id", None);
        apply_refs(&mut row, &refs);
        assert_eq!(row.get("office_id"), Some(&json!(id.to_string())));
        assert_eq!(row.get("backup_office_id"), Some(&Value::Null));
    }
}
