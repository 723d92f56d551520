//! The validated stage graph and per-backend run plans.

use super::{GraphBuilder, StageSpec};
use crate::core::{BackendKind, Capabilities};
use crate::errors::ConfigError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A validated, acyclic graph of stages.
///
/// Read-only after construction; share it across backends with `Arc`.
#[derive(Debug)]
pub struct StageGraph {
    /// Stages in declaration order.
    stages: Vec<Arc<StageSpec>>,
    /// Name to declaration index.
    index: HashMap<String, usize>,
    /// Deduplicated dependency indices per stage.
    dependencies: Vec<Vec<usize>>,
    /// Reverse edges.
    dependents: Vec<Vec<usize>>,
    /// Topological order (declaration indices).
    order: Vec<usize>,
    /// Position of each stage in `order`.
    position: Vec<usize>,
}

impl StageGraph {
    /// Validates a stage list and builds the graph.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build`].
    pub fn build(stages: impl IntoIterator<Item = StageSpec>) -> Result<Self, ConfigError> {
        GraphBuilder::new().stages(stages).build()
    }

    pub(crate) fn from_parts(
        stages: Vec<Arc<StageSpec>>,
        index: HashMap<String, usize>,
        dependencies: Vec<Vec<usize>>,
        order: Vec<usize>,
    ) -> Self {
        let mut dependents = vec![Vec::new(); stages.len()];
        for (node, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }
        let mut position = vec![0; stages.len()];
        for (pos, &node) in order.iter().enumerate() {
            position[node] = pos;
        }

        Self {
            stages,
            index,
            dependencies,
            dependents,
            order,
            position,
        }
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the stage at a declaration index.
    #[must_use]
    pub fn stage(&self, index: usize) -> &Arc<StageSpec> {
        &self.stages[index]
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<StageSpec>> {
        self.index_of(name).map(|i| &self.stages[i])
    }

    /// Returns the declaration index of a stage.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<StageSpec>> {
        self.stages.iter()
    }

    /// Stages in deterministic topological order.
    pub fn topo_order(&self) -> impl Iterator<Item = &Arc<StageSpec>> {
        self.order.iter().map(|&i| &self.stages[i])
    }

    /// Declaration indices in topological order.
    #[must_use]
    pub fn topo_indices(&self) -> &[usize] {
        &self.order
    }

    /// Position of a stage within the topological order.
    #[must_use]
    pub fn topo_position(&self, index: usize) -> usize {
        self.position[index]
    }

    /// Indices of the stages `index` depends on.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Indices of the stages that depend on `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Resolves the run plan for one backend.
    ///
    /// Stages whose kind the backend cannot execute are listed separately and
    /// left out of the ordering.
    #[must_use]
    pub fn plan_for(&self, backend: &str, capabilities: Capabilities) -> RunPlan {
        let mut steps = Vec::new();
        let mut unsupported = Vec::new();

        for &i in &self.order {
            let spec = &self.stages[i];
            let entry = PlanEntry {
                index: i,
                name: spec.name.clone(),
                kind: spec.kind,
                depends_on: self.dependencies[i]
                    .iter()
                    .map(|&d| self.stages[d].name.clone())
                    .collect(),
                action: spec.action_for(backend).describe(),
            };
            if capabilities.supports(spec.kind) {
                steps.push(entry);
            } else {
                unsupported.push(entry);
            }
        }

        RunPlan {
            backend: backend.to_string(),
            steps,
            unsupported,
        }
    }
}

/// One stage in a run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    /// Declaration index in the graph.
    #[serde(skip)]
    pub index: usize,
    /// The stage name.
    pub name: String,
    /// The stage kind.
    pub kind: BackendKind,
    /// Dependency names.
    pub depends_on: Vec<String>,
    /// The resolved action, described.
    pub action: String,
}

/// The backend-specific execution order for a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    /// The backend name.
    pub backend: String,
    /// Supported stages in topological order.
    pub steps: Vec<PlanEntry>,
    /// Stages the backend cannot execute.
    pub unsupported: Vec<PlanEntry>,
}

impl RunPlan {
    /// Total number of stages covered by the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len() + self.unsupported.len()
    }

    /// Returns true if the plan covers no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;
    use crate::graph::DeployAction;
    use crate::testing::graph_from_edges;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn build_graph() -> StageGraph {
        StageGraph::build([
            StageSpec::new("app", BackendKind::Container).with_dependencies(["db", "cache"]),
            StageSpec::new("db", BackendKind::Container),
            StageSpec::new("cache", BackendKind::Process),
        ])
        .unwrap()
    }

    #[test]
    fn test_graph_accessors() {
        let graph = build_graph();
        assert_eq!(graph.len(), 3);
        assert!(!graph.is_empty());
        assert_eq!(graph.get("db").unwrap().name, "db");
        assert!(graph.get("missing").is_none());

        let app = graph.index_of("app").unwrap();
        assert_eq!(graph.dependencies(app).len(), 2);
        let db = graph.index_of("db").unwrap();
        assert_eq!(graph.dependents(db), &[app]);
    }

    #[test]
    fn test_topological_order() {
        let graph = build_graph();
        let names: Vec<&str> = graph.topo_order().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db", "cache", "app"]);

        let app = graph.index_of("app").unwrap();
        assert_eq!(graph.topo_position(app), 2);
    }

    #[test]
    fn test_plan_excludes_unsupported() {
        let graph = build_graph();
        let plan = graph.plan_for("docker", Capabilities::only(BackendKind::Container));

        let steps: Vec<&str> = plan.steps.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(steps, vec!["db", "app"]);
        assert_eq!(plan.unsupported.len(), 1);
        assert_eq!(plan.unsupported[0].name, "cache");
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_plan_uses_backend_override() {
        let graph = StageGraph::build([StageSpec::new("db", BackendKind::Process)
            .with_action(DeployAction::command(["start-db"]))
            .with_override("ci", DeployAction::External)])
        .unwrap();

        let plan = graph.plan_for("ci", Capabilities::all());
        assert_eq!(plan.steps[0].action, "external (probe only)");
        let plan = graph.plan_for("local", Capabilities::all());
        assert_eq!(plan.steps[0].action, "run `start-db`");
    }

    #[test]
    fn test_plan_serializes_without_index() {
        let graph = build_graph();
        let plan = graph.plan_for("local", Capabilities::all());
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["backend"], "local");
        assert!(json["steps"][0].get("index").is_none());
        assert_eq!(json["steps"][2]["depends_on"], serde_json::json!(["db", "cache"]));
    }

    fn forward_edges(raw: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
        raw.into_iter()
            .filter(|(a, b)| a < b)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn edge_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 1..24)))
    }

    proptest! {
        #[test]
        fn test_topo_order_respects_every_edge((n, raw) in edge_strategy()) {
            let edges = forward_edges(raw);
            let graph = graph_from_edges(n, &edges).unwrap();

            let mut seen: Vec<usize> = graph.topo_indices().to_vec();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());

            for (dep, dependent) in edges {
                prop_assert!(graph.topo_position(dep) < graph.topo_position(dependent));
            }
        }

        #[test]
        fn test_back_edge_is_rejected_as_cycle((n, raw) in edge_strategy(), pick in any::<prop::sample::Index>()) {
            let mut edges = forward_edges(raw);
            prop_assume!(!edges.is_empty());
            let (a, b) = edges[pick.index(edges.len())];
            edges.push((b, a));

            let err = graph_from_edges(n, &edges).unwrap_err();
            prop_assert_eq!(err.code(), Some(codes::CYCLE));
            prop_assert!(!err.stages.is_empty());
        }
    }
}
