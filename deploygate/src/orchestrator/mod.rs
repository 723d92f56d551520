//! Run orchestration across backends.
//!
//! Each backend runs on its own task; a slow or unavailable backend never
//! holds up another. Within a backend, stages follow the graph's dependency
//! edges with bounded fan-out.

mod board;
mod scheduler;

#[cfg(test)]
mod integration_tests;

pub use board::{OutcomeBoard, TransitionError};

use crate::backends::Backend;
use crate::cancellation::CancellationToken;
use crate::core::{Outcome, OutcomeStatus};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::graph::StageGraph;
use crate::report::{BackendOutcomes, RunReport};
use chrono::Utc;
use futures::future::join_all;
use scheduler::BackendRun;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Run deadline in seconds; `None` means no deadline.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: Option<u64>,
    /// Maximum concurrent stages per backend.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Probe each stage once before deploying it.
    #[serde(default = "default_precheck")]
    pub precheck: bool,
    /// Bound on each cleanup callback, in seconds.
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,
    /// Bound on a backend's availability check, in seconds.
    #[serde(default = "default_availability_timeout_secs")]
    pub availability_timeout_secs: u64,
}

#[allow(clippy::unnecessary_wraps)]
const fn default_deadline_secs() -> Option<u64> {
    Some(900)
}

const fn default_concurrency() -> usize {
    2
}

const fn default_precheck() -> bool {
    true
}

const fn default_cleanup_timeout_secs() -> u64 {
    120
}

const fn default_availability_timeout_secs() -> u64 {
    15
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            concurrency: default_concurrency(),
            precheck: default_precheck(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
            availability_timeout_secs: default_availability_timeout_secs(),
        }
    }
}

impl RunSettings {
    /// Creates default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline_secs = deadline.map(|d| d.as_secs().max(1));
        self
    }

    /// Sets the per-backend concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enables or disables the pre-deploy probe.
    #[must_use]
    pub fn with_precheck(mut self, precheck: bool) -> Self {
        self.precheck = precheck;
        self
    }

    /// Sets the per-callback cleanup bound.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the availability check bound.
    #[must_use]
    pub fn with_availability_timeout(mut self, timeout: Duration) -> Self {
        self.availability_timeout_secs = timeout.as_secs();
        self
    }

    /// The run deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Effective concurrency; never zero.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Per-callback cleanup bound.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    /// Availability check bound.
    #[must_use]
    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs)
    }
}

/// Runs a stage graph against a set of backends.
///
/// # Example
///
/// ```no_run
/// use deploygate::prelude::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), ConfigError> {
/// let graph = StageGraph::build([
///     StageSpec::new("db", BackendKind::Process)
///         .with_action(DeployAction::command(["./start-db.sh"])),
/// ])?;
/// let backends = BackendRegistry::new().resolve_all(&["local"])?;
///
/// let report = Orchestrator::new(RunSettings::default())
///     .run(Arc::new(graph), backends)
///     .await;
/// std::process::exit(report.exit_code());
/// # }
/// ```
pub struct Orchestrator {
    settings: RunSettings,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Creates an orchestrator that emits no events.
    #[must_use]
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The settings in use.
    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Runs every backend to completion.
    pub async fn run(&self, graph: Arc<StageGraph>, backends: Vec<Arc<dyn Backend>>) -> RunReport {
        self.run_with_token(graph, backends, CancellationToken::new())
            .await
    }

    /// Runs every backend to completion, stopping early when `token` is
    /// cancelled.
    ///
    /// Never fails: every stage on every backend ends with a terminal
    /// outcome, and backends are torn down on every path.
    pub async fn run_with_token(
        &self,
        graph: Arc<StageGraph>,
        backends: Vec<Arc<dyn Backend>>,
        token: CancellationToken,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let backend_names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();

        info!(%run_id, backends = ?backend_names, stages = graph.len(), "run started");
        self.sink
            .emit(
                names::RUN_STARTED,
                Some(json!({
                    "run_id": run_id,
                    "backends": backend_names,
                    "stages": graph.len(),
                })),
            )
            .await;

        let run_token = token.child_token();
        let deadline = self.settings.deadline().map(|d| {
            run_token.cancel_after(d, format!("run deadline of {}s exceeded", d.as_secs()))
        });

        let handles: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                let run = BackendRun {
                    backend,
                    graph: graph.clone(),
                    settings: self.settings.clone(),
                    sink: self.sink.clone(),
                    cancel: run_token.clone(),
                };
                tokio::spawn(run.run())
            })
            .collect();

        let mut backend_runs = Vec::with_capacity(handles.len());
        for (name, joined) in backend_names.iter().zip(join_all(handles).await) {
            match joined {
                Ok(run) => backend_runs.push(run),
                Err(err) => {
                    error!(backend = %name, error = %err, "backend task panicked");
                    backend_runs.push(panicked_backend(name, &graph, &err.to_string()));
                }
            }
        }

        if let Some(timer) = deadline {
            timer.abort();
        }

        let report = RunReport::aggregate(run_id, started_at, Utc::now(), backend_runs);
        info!(
            %run_id,
            passed = report.summary.passed,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            exit_code = report.exit_code(),
            "run finished"
        );
        self.sink
            .emit(
                names::RUN_FINISHED,
                Some(json!({
                    "run_id": run_id,
                    "summary": report.summary,
                    "exit_code": report.exit_code(),
                })),
            )
            .await;
        report
    }
}

fn panicked_backend(name: &str, graph: &StageGraph, reason: &str) -> BackendOutcomes {
    let outcomes = graph
        .topo_order()
        .map(|stage| {
            Outcome::skipped(
                stage.name.clone(),
                name,
                OutcomeStatus::Failed,
                format!("backend task panicked: {reason}"),
            )
        })
        .collect();
    BackendOutcomes::new(name, outcomes)
}
