//! Stage and graph fixtures.

use std::time::Duration;

use crate::core::BackendKind;
use crate::errors::ConfigError;
use crate::graph::{JitterStrategy, ReadinessCheck, RetryPolicy, StageGraph, StageSpec};

/// A process stage with a one-second poll and a thirty-second budget.
///
/// Retries use a fixed 100ms base delay without jitter so paused-time tests
/// stay deterministic.
#[must_use]
pub fn test_stage(name: &str) -> StageSpec {
    StageSpec::new(name, BackendKind::Process)
        .with_readiness(
            ReadinessCheck::default()
                .with_interval(Duration::from_secs(1))
                .with_timeout(Duration::from_secs(30)),
        )
        .with_retry(
            RetryPolicy::new()
                .with_base_delay_ms(100)
                .with_jitter(JitterStrategy::None),
        )
}

/// `db` and `cache`, with `app` depending on both.
#[must_use]
pub fn scenario_stages() -> Vec<StageSpec> {
    vec![
        test_stage("db"),
        test_stage("cache"),
        test_stage("app").with_dependencies(["db", "cache"]),
    ]
}

/// The graph of [`scenario_stages`].
///
/// # Panics
///
/// Never; the fixture is acyclic.
#[must_use]
#[allow(clippy::expect_used)]
pub fn scenario_graph() -> StageGraph {
    StageGraph::build(scenario_stages()).expect("scenario graph is acyclic")
}

/// `s0 <- s1 <- ... <- s{len-1}`.
///
/// # Errors
///
/// Returns an error for `len == 0`.
pub fn chain_graph(len: usize) -> Result<StageGraph, ConfigError> {
    StageGraph::build((0..len).map(|i| {
        let stage = test_stage(&format!("s{i}"));
        if i == 0 {
            stage
        } else {
            stage.with_dependency(format!("s{}", i - 1))
        }
    }))
}

/// `layers` layers of `width` stages, each depending on every stage of the
/// layer before.
///
/// # Errors
///
/// Returns an error if either dimension is zero.
pub fn layered_graph(layers: usize, width: usize) -> Result<StageGraph, ConfigError> {
    let name = |layer: usize, slot: usize| format!("l{layer}s{slot}");
    StageGraph::build((0..layers).flat_map(|layer| {
        (0..width).map(move |slot| {
            let stage = test_stage(&name(layer, slot));
            if layer == 0 {
                stage
            } else {
                stage.with_dependencies((0..width).map(|dep| name(layer - 1, dep)))
            }
        })
    }))
}

/// Builds `s0..s{n-1}` with `(dependency, dependent)` edges.
///
/// # Errors
///
/// Returns the build error, e.g. for a cycle among the edges.
pub fn graph_from_edges(n: usize, edges: &[(usize, usize)]) -> Result<StageGraph, ConfigError> {
    StageGraph::build((0..n).map(|i| {
        test_stage(&format!("s{i}")).with_dependencies(
            edges
                .iter()
                .filter(|(_, dependent)| *dependent == i)
                .map(|(dep, _)| format!("s{dep}")),
        )
    }))
}
