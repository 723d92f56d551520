//! Testing utilities for deploygate runs.
//!
//! This module provides:
//! - A scripted in-memory backend with call recording
//! - Stage and graph fixtures

mod fixtures;
mod mocks;

pub use fixtures::{chain_graph, graph_from_edges, layered_graph, scenario_graph, scenario_stages, test_stage};
pub use mocks::{BackendCall, ScriptedBackend};
