//! # Deploygate
//!
//! Dependency-ordered deployment across several backends, gated on
//! readiness.
//!
//! A deployment is a graph of stages. Each stage names a deploy action and a
//! readiness check. Deploygate runs the same graph against every selected
//! backend (local processes, single containers, a compose project, an
//! ephemeral kind cluster, a persistent Kubernetes cluster) and reports, per
//! backend, which stages became ready.
//!
//! - **Stage graph**: validated once, cycle-free, shared read-only
//! - **Backends**: one trait, one adapter per target, typed probe signals
//! - **Readiness**: poll until healthy or timed out, never a fixed sleep
//! - **Orchestration**: backends in parallel, bounded fan-out within one
//! - **Cancellation**: run deadline and Ctrl-C, teardown on every path
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deploygate::prelude::*;
//!
//! let config = DeploymentConfig::load("deploygate.yaml")?;
//! let graph = Arc::new(config.build_graph()?);
//! let backends = config.registry().resolve_all(&["local", "docker"])?;
//!
//! let report = Orchestrator::new(config.settings)
//!     .with_event_sink(Arc::new(LoggingEventSink::default()))
//!     .run(graph, backends)
//!     .await;
//! println!("{}", render(&report, ReportFormat::Text)?);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backends;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod orchestrator;
pub mod prober;
pub mod report;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backends::{Backend, BackendConfig, BackendRegistry, ToolCommand};
    pub use crate::cancellation::{CancellationToken, CleanupRegistry};
    pub use crate::config::DeploymentConfig;
    pub use crate::core::{
        ActionReport, ActionResult, BackendKind, Capabilities, Outcome, OutcomeStatus,
        ProbeResult, SignalState,
    };
    pub use crate::errors::{
        BackendError, ConfigError, CycleDetectedError, DeploygateError, ErrorInfo,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{
        DeployAction, ProbeTarget, ReadinessCheck, RetryPolicy, RunPlan, StageGraph, StageSpec,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{Orchestrator, RunSettings};
    pub use crate::prober::{await_ready, ProbeVerdict};
    pub use crate::report::{render, ReportFormat, RunReport};
}
