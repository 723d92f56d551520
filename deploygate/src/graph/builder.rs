//! Stage graph builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{codes, ConfigError, CycleDetectedError, ErrorInfo};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Builder for validated stage graphs.
///
/// Unlike a streaming builder, dependencies may refer to stages declared
/// later; everything is checked in [`GraphBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    stages: Vec<StageSpec>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Adds several stages, keeping their order.
    #[must_use]
    pub fn stages(mut self, specs: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(specs);
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the stages and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty list, an invalid stage, a duplicate name,
    /// a dependency on an unknown stage, or a cycle.
    pub fn build(self) -> Result<StageGraph, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::new("Stage list is empty")
                .with_error_info(ErrorInfo::new(codes::EMPTY, "Cannot build an empty stage graph")));
        }

        let mut index: HashMap<String, usize> = HashMap::with_capacity(self.stages.len());
        for (i, spec) in self.stages.iter().enumerate() {
            spec.validate()?;
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ConfigError::new(format!("Duplicate stage name '{}'", spec.name))
                    .with_stages(vec![spec.name.clone()])
                    .with_error_info(
                        ErrorInfo::new(codes::DUPLICATE, format!("Stage '{}' is declared twice", spec.name))
                            .with_context_entry("stage", spec.name.clone()),
                    ));
            }
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(self.stages.len());
        for spec in &self.stages {
            let mut seen = HashSet::new();
            let mut deps = Vec::with_capacity(spec.depends_on.len());
            for dep in &spec.depends_on {
                let Some(&dep_index) = index.get(dep) else {
                    return Err(ConfigError::new(format!(
                        "Stage '{}' depends on unknown stage '{}'",
                        spec.name, dep
                    ))
                    .with_stages(vec![spec.name.clone(), dep.clone()])
                    .with_error_info(
                        ErrorInfo::new(codes::MISSING_DEP, format!("Dependency '{dep}' not found"))
                            .with_context_entry("stage", spec.name.clone()),
                    ));
                };
                if seen.insert(dep_index) {
                    deps.push(dep_index);
                }
            }
            dependencies.push(deps);
        }

        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        let order = topological_order(&dependencies)
            .map_err(|cycle| CycleDetectedError::new(cycle.iter().map(|&i| names[i].to_string()).collect()))?;

        let stages = self.stages.into_iter().map(Arc::new).collect();
        Ok(StageGraph::from_parts(stages, index, dependencies, order))
    }
}

/// Kahn's algorithm; ties between ready stages go to the earliest declared.
///
/// On a cycle, returns the cycle as a path of indices with the first node
/// repeated at the end.
fn topological_order(dependencies: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &child in &dependents[node] {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let unresolved: Vec<usize> = (0..n).filter(|&i| remaining[i] > 0).collect();
    Err(find_cycle(dependencies, &unresolved))
}

fn find_cycle(dependencies: &[Vec<usize>], unresolved: &[usize]) -> Vec<usize> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for &start in unresolved {
        if !visited.contains(&start) {
            if let Some(cycle) = dfs_cycle(start, dependencies, &mut visited, &mut on_stack, &mut path) {
                return cycle;
            }
        }
    }

    // Every unresolved node sits on or behind a cycle; unreachable in practice.
    unresolved.to_vec()
}

fn dfs_cycle(
    node: usize,
    dependencies: &[Vec<usize>],
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for &dep in &dependencies[node] {
        if !visited.contains(&dep) {
            if let Some(cycle) = dfs_cycle(dep, dependencies, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack.contains(&dep) {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
    }

    path.pop();
    on_stack.remove(&node);
    None
}
