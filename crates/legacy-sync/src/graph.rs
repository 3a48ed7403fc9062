//! Dependency graph and leveled execution plan.
//!
//! Entities are leveled with Kahn's algorithm over a petgraph `DiGraphMap`:
//! every entity in level `n`
//! depends only on entities in levels `< n`. Ties inside a level are broken
//! by name so the plan is stable across runs.

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::entity::{EntityCatalog, EntityDefinition};
use crate::error::{MigrateError, Result};

/// Read-only, leveled execution plan for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    levels: Vec<Vec<String>>,
    #[serde(skip)]
    entities: BTreeMap<String, Arc<EntityDefinition>>,
    #[serde(skip)]
    level_index: HashMap<String, usize>,
    #[serde(skip)]
    dependents: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Entity names per level, in execution order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Level an entity is scheduled in.
    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.level_index.get(name).copied()
    }

    /// Definition of a planned entity.
    pub fn entity(&self, name: &str) -> Option<&Arc<EntityDefinition>> {
        self.entities.get(name)
    }

    /// Planned definitions in name order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDefinition>> {
        self.entities.values()
    }

    /// Every planned entity that transitively depends on `name`, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(&current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        stack.push(child.clone());
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Number of planned entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Builds an [`ExecutionPlan`] from an entity catalog.
pub struct DependencyGraph;

impl DependencyGraph {
    /// Level the selected entities (all when `selection` is empty).
    ///
    /// Edges to entities outside the selection count as satisfied. Fails with
    /// [`MigrateError::UnknownEntity`] on a dangling name and
    /// [`MigrateError::CyclicDependency`] when no order exists.
    pub fn build(catalog: &EntityCatalog, selection: &[String]) -> Result<ExecutionPlan> {
        for name in selection {
            catalog.require(name, "run.entities")?;
        }
        for def in catalog.iter() {
            for dep in &def.depends_on {
                catalog.require(dep, &def.name)?;
            }
        }

        let selected: BTreeMap<String, Arc<EntityDefinition>> = catalog
            .iter()
            .filter(|d| selection.is_empty() || selection.contains(&d.name))
            .map(|d| (d.name.clone(), Arc::clone(d)))
            .collect();

        // Edges point from a dependency to its dependent.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for (name, def) in &selected {
            graph.add_node(name.as_str());
            for dep in def.depends_on.iter().filter(|d| selected.contains_key(*d)) {
                graph.add_edge(dep.as_str(), name.as_str(), ());
            }
        }

        let mut in_degree: BTreeMap<&str, usize> = graph
            .nodes()
            .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut levels = Vec::new();
        let mut level_index = HashMap::new();
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();
            for name in &ready {
                in_degree.remove(name);
                level_index.insert(name.to_string(), levels.len());
                for child in graph.neighbors_directed(*name, Direction::Outgoing) {
                    if let Some(d) = in_degree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(child);
                        }
                    }
                }
            }
            levels.push(ready.iter().map(|s| s.to_string()).collect());
            ready = next;
        }

        if !in_degree.is_empty() {
            return Err(MigrateError::CyclicDependency {
                entities: cycle_members(&graph),
            });
        }

        let dependents: HashMap<String, Vec<String>> = graph
            .nodes()
            .map(|n| {
                let mut children: Vec<String> = graph
                    .neighbors_directed(n, Direction::Outgoing)
                    .map(str::to_string)
                    .collect();
                children.sort();
                (n.to_string(), children)
            })
            .filter(|(_, children)| !children.is_empty())
            .collect();

        Ok(ExecutionPlan {
            levels,
            entities: selected,
            level_index,
            dependents,
        })
    }
}

/// Entities that sit on a cycle, sorted. Entities that only depend on a
/// cycle are left out.
fn cycle_members(graph: &DiGraphMap<&str, ()>) -> Vec<String> {
    let mut members: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(str::to_string)
        .collect();
    members.sort();
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, deps: &[&str]) -> EntityDefinition {
        let mut d = EntityDefinition::new(name, format!("legacy.{name}"), format!("public.{name}"));
        d.depends_on = deps.iter().map(|s| s.to_string()).collect();
        d
    }

    fn catalog(defs: Vec<EntityDefinition>) -> EntityCatalog {
        EntityCatalog::new(defs).unwrap()
    }

    #[test]
    fn test_levels_respect_dependencies() {
        let cat = catalog(vec![
            def("doctors", &["offices", "specialties"]),
            def("offices", &[]),
            def("specialties", &[]),
            def("appointments", &["doctors", "patients"]),
            def("patients", &["offices"]),
        ]);
        let plan = DependencyGraph::build(&cat, &[]).unwrap();
        assert_eq!(
            plan.levels(),
            &[
                vec!["offices".to_string(), "specialties".to_string()],
                vec!["doctors".to_string(), "patients".to_string()],
                vec!["appointments".to_string()],
            ]
        );
        assert_eq!(plan.level_of("appointments"), Some(2));
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_cycle_is_reported() {
        let cat = catalog(vec![def("x", &["y"]), def("y", &["x"]), def("z", &[])]);
        let err = DependencyGraph::build(&cat, &[]).unwrap_err();
        match err {
            MigrateError::CyclicDependency { entities } => {
                assert_eq!(entities, vec!["x".to_string(), "y".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_excludes_downstream_entities() {
        let cat = catalog(vec![
            def("x", &["y"]),
            def("y", &["x"]),
            def("z", &["x"]),
            def("w", &["z"]),
        ]);
        match DependencyGraph::build(&cat, &[]).unwrap_err() {
            MigrateError::CyclicDependency { entities } => {
                assert_eq!(entities, vec!["x".to_string(), "y".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let cat = catalog(vec![def("x", &["x"]), def("z", &["x"])]);
        match DependencyGraph::build(&cat, &[]).unwrap_err() {
            MigrateError::CyclicDependency { entities } => assert_eq!(entities, vec!["x".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let cat = catalog(vec![def("doctors", &["offices"])]);
        let err = DependencyGraph::build(&cat, &[]).unwrap_err();
        assert!(matches!(err, MigrateError::UnknownEntity { ref entity, .. } if entity == "offices"));
    }

    #[test]
    fn test_selection_treats_unselected_as_satisfied() {
        let cat = catalog(vec![def("a", &[]), def("b", &["a"]), def("c", &["b"])]);
        let plan = DependencyGraph::build(&cat, &["b".into(), "c".into()]).unwrap();
        assert_eq!(plan.levels(), &[vec!["b".to_string()], vec!["c".to_string()]]);
        assert!(plan.entity("a").is_none());

        let err = DependencyGraph::build(&cat, &["nope".into()]).unwrap_err();
        assert!(matches!(err, MigrateError::UnknownEntity { .. }));
    }

    #[test]
    fn test_dependents_are_transitive() {
        let cat = catalog(vec![
            def("a", &[]),
            def("b", &["a"]),
            def("c", &["b"]),
            def("d", &[]),
        ]);
        let plan = DependencyGraph::build(&cat, &[]).unwrap();
        assert_eq!(plan.dependents_of("a"), vec!["b".to_string(), "c".to_string()]);
        assert!(plan.dependents_of("d").is_empty());
    }
}
