//! Backend adapters: uniform access to deployment targets.
//!
//! Every adapter wraps an external tool through [`ToolCommand`] and keeps all
//! tool-specific parsing to itself. The orchestrator only sees typed
//! [`ActionResult`]s and [`ProbeResult`]s.

mod cluster;
mod command;
mod compose;
mod container;
mod process;
mod registry;
mod targets;

pub use cluster::{ClusterBackend, KindConfig, KubernetesConfig};
pub use command::{ToolCommand, ToolError, ToolOutput, DEFAULT_TOOL_TIMEOUT};
pub use compose::{ComposeBackend, ComposeConfig};
pub use container::{DockerBackend, DockerConfig};
pub use process::{LocalConfig, LocalProcessBackend};
pub use registry::{BackendConfig, BackendRegistry, BUILTIN_BACKENDS};
pub use targets::probe_target;

use crate::core::{ActionReport, ActionResult, Capabilities, ProbeResult};
use crate::errors::BackendError;
use crate::graph::{DeployAction, StageSpec};
use async_trait::async_trait;
use std::time::Duration;

/// A deployment target.
///
/// Implementations must be cheap to share (`Arc<dyn Backend>`) and must not
/// block inside `probe`; the prober owns polling and timing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// The instance name used in reports.
    fn name(&self) -> &str;

    /// The stage kinds this backend executes.
    fn capabilities(&self) -> Capabilities;

    /// Checks that the backend's tooling responds.
    async fn is_available(&self) -> bool;

    /// Acquires backend-scoped resources before any stage runs.
    async fn prepare(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Performs the stage's deploy action.
    async fn execute(&self, stage: &StageSpec) -> ActionResult;

    /// Reads the stage's health once.
    async fn probe(&self, stage: &StageSpec) -> ProbeResult;

    /// Releases everything `prepare` and `execute` created.
    async fn teardown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Runs a foreground `command` action and maps the result.
///
/// A command that exceeds its timeout is a retryable failure.
pub(crate) async fn run_command_action(stage: &str, action: &DeployAction) -> ActionResult {
    let DeployAction::Command {
        argv,
        env,
        cwd,
        timeout_secs,
        ..
    } = action
    else {
        return Err(unsupported_action(stage, "command runner", action));
    };
    let Some(cmd) = ToolCommand::from_argv(argv) else {
        return Err(BackendError::action_failed(stage, "command argv is empty"));
    };
    let cmd = cmd
        .envs(env)
        .current_dir(cwd.clone())
        .timeout(timeout_secs.map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_secs));
    run_tool(stage, &cmd).await
}

/// Runs a tool call as a deploy action.
pub(crate) async fn run_tool(stage: &str, cmd: &ToolCommand) -> ActionResult {
    match cmd.output().await {
        Ok(output) if output.success() => {
            let summary = output
                .stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map_or_else(|| cmd.to_string(), String::from);
            Ok(ActionReport::with_summary(summary))
        }
        Ok(output) => Err(BackendError::action_failed(
            stage,
            format!("`{cmd}` failed with {}", output.failure_detail()),
        )),
        Err(e @ ToolError::TimedOut { .. }) => {
            Err(BackendError::action_failed_retryable(stage, e.to_string()))
        }
        Err(e) => Err(BackendError::action_failed(stage, e.to_string())),
    }
}

pub(crate) fn unsupported_action(stage: &str, backend: &str, action: &DeployAction) -> BackendError {
    BackendError::action_failed(
        stage,
        format!("{backend} cannot perform action: {}", action.describe()),
    )
}
