//! Single-container backend over the docker CLI.

use super::{
    probe_target, run_command_action, run_tool, unsupported_action, Backend, ToolCommand,
};
use crate::core::{ActionReport, ActionResult, BackendKind, Capabilities, ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::{DeployAction, ProbeTarget, StageSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const INSPECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings for a [`DockerBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// The docker binary.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Prefix for generated container names.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Leave containers running after the run.
    #[serde(default)]
    pub keep: bool,
}

fn default_binary() -> String {
    "docker".to_string()
}

fn default_prefix() -> String {
    "deploygate".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            prefix: default_prefix(),
            keep: false,
        }
    }
}

/// Runs `container` actions with `docker run -d`.
#[derive(Debug)]
pub struct DockerBackend {
    name: String,
    config: DockerConfig,
    created: Mutex<Vec<String>>,
}

impl DockerBackend {
    /// Creates a backend from configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: DockerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            created: Mutex::new(Vec::new()),
        }
    }

    fn docker(&self) -> ToolCommand {
        ToolCommand::new(self.config.binary.clone())
    }

    /// The container name used for a stage.
    #[must_use]
    pub fn container_name(&self, stage: &StageSpec) -> Option<String> {
        match stage.action_for(&self.name) {
            DeployAction::Container { name, .. } => Some(
                name.clone()
                    .unwrap_or_else(|| format!("{}-{}", self.config.prefix, stage.name)),
            ),
            _ => None,
        }
    }

    /// Builds the `docker run` invocation for a container action.
    fn run_command(&self, stage: &StageSpec, container: &str, action: &DeployAction) -> Option<ToolCommand> {
        let DeployAction::Container {
            image,
            ports,
            env,
            args,
            ..
        } = action
        else {
            return None;
        };

        let mut cmd = self
            .docker()
            .args(["run", "-d", "--name", container])
            .args(["--label".to_string(), format!("deploygate.stage={}", stage.name)]);
        for port in ports {
            cmd = cmd.args(["-p", port.as_str()]);
        }
        for (key, value) in env {
            cmd = cmd.args(["-e".to_string(), format!("{key}={value}")]);
        }
        Some(cmd.arg(image.clone()).args(args.iter().cloned()))
    }

    async fn run_container(&self, stage: &StageSpec, action: &DeployAction) -> ActionResult {
        let Some(container) = self.container_name(stage) else {
            return Err(unsupported_action(&stage.name, &self.name, action));
        };
        let Some(run) = self.run_command(stage, &container, action) else {
            return Err(unsupported_action(&stage.name, &self.name, action));
        };

        // A leftover container with the same name would make `run` fail.
        match self
            .docker()
            .args(["rm", "-f", container.as_str()])
            .timeout(INSPECT_TIMEOUT)
            .output()
            .await
        {
            Ok(output) if !output.success() => debug!(
                backend = %self.name,
                container = %container,
                detail = %output.failure_detail(),
                "pre-run container removal reported failure"
            ),
            Err(e) => debug!(
                backend = %self.name,
                container = %container,
                error = %e,
                "pre-run container removal failed"
            ),
            Ok(_) => {}
        }

        // `run` can create the container and still fail to start it.
        {
            let mut created = self.created.lock();
            if !created.contains(&container) {
                created.push(container.clone());
            }
        }
        let report = run_tool(&stage.name, &run).await?;
        info!(backend = %self.name, stage = %stage.name, container = %container, "container started");
        Ok(report)
    }

    async fn native_signal(&self, stage: &StageSpec) -> ProbeResult {
        let Some(container) = self.container_name(stage) else {
            return Err(BackendError::probe(
                &stage.name,
                "native probe needs a container action",
            ));
        };
        let output = self
            .docker()
            .args(["inspect", "--format", "{{json .State}}", container.as_str()])
            .timeout(INSPECT_TIMEOUT)
            .output()
            .await
            .map_err(|e| BackendError::probe(&stage.name, e.to_string()))?;

        if !output.success() {
            if output.stderr.contains("No such") {
                return Ok(SignalState::pending(format!("container {container} not found")));
            }
            return Err(BackendError::probe(&stage.name, output.failure_detail()));
        }
        parse_container_state(&output.stdout).map_err(|e| BackendError::probe(&stage.name, e))
    }
}

/// Maps `docker inspect --format '{{json .State}}'` output to a signal.
///
/// # Errors
///
/// Returns an error if the output is not a JSON object with a `Status`.
pub fn parse_container_state(raw: &str) -> Result<SignalState, String> {
    let state: Value =
        serde_json::from_str(raw.trim()).map_err(|e| format!("unparseable container state: {e}"))?;
    let status = state
        .get("Status")
        .and_then(Value::as_str)
        .ok_or_else(|| "container state has no Status".to_string())?;

    match status {
        "running" => {
            let health = state
                .get("Health")
                .and_then(|h| h.get("Status"))
                .and_then(Value::as_str);
            Ok(match health {
                None | Some("healthy" | "none") => SignalState::Ready,
                Some("unhealthy") => SignalState::unhealthy("health check failing"),
                Some(other) => SignalState::pending(format!("health: {other}")),
            })
        }
        "exited" | "dead" => {
            let code = state.get("ExitCode").and_then(Value::as_i64).unwrap_or(-1);
            Ok(SignalState::unhealthy(format!("{status} (exit code {code})")))
        }
        other => Ok(SignalState::pending(other.to_string())),
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::only(BackendKind::Container)
    }

    async fn is_available(&self) -> bool {
        self.docker()
            .args(["info", "--format", "{{.ServerVersion}}"])
            .timeout(INSPECT_TIMEOUT)
            .succeeds()
            .await
    }

    async fn execute(&self, stage: &StageSpec) -> ActionResult {
        let action = stage.action_for(&self.name);
        match action {
            DeployAction::Container { .. } => self.run_container(stage, action).await,
            DeployAction::Command { .. } => run_command_action(&stage.name, action).await,
            DeployAction::External => Ok(ActionReport::empty()),
            other => Err(unsupported_action(&stage.name, &self.name, other)),
        }
    }

    async fn probe(&self, stage: &StageSpec) -> ProbeResult {
        match &stage.readiness.probe {
            ProbeTarget::Native => self.native_signal(stage).await,
            target => probe_target(&stage.name, target).await,
        }
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let created = std::mem::take(&mut *self.created.lock());
        if self.config.keep || created.is_empty() {
            return Ok(());
        }
        let output = self
            .docker()
            .args(["rm", "-f"])
            .args(created.iter().cloned())
            .output()
            .await
            .map_err(|e| BackendError::action_failed("teardown", e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            warn!(backend = %self.name, containers = ?created, "container removal failed");
            Err(BackendError::action_failed("teardown", output.failure_detail()))
        }
    }
}
