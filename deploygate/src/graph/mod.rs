//! Stage definitions and the dependency graph.
//!
//! This module provides:
//! - [`StageSpec`] and its deploy action, readiness and retry settings
//! - [`GraphBuilder`] for validating stage lists
//! - [`StageGraph`] with deterministic topological ordering
//! - [`RunPlan`] resolution per backend

mod builder;
mod dag;
mod retry;
mod spec;

pub use builder::GraphBuilder;
pub use dag::{PlanEntry, RunPlan, StageGraph};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use spec::{DeployAction, ProbeTarget, ReadinessCheck, StageSpec};
