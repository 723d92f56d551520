//! Multi-container backend over `docker compose`.

use super::{
    probe_target, run_command_action, run_tool, unsupported_action, Backend, ToolCommand,
};
use crate::core::{ActionReport, ActionResult, BackendKind, Capabilities, ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::{DeployAction, ProbeTarget, StageSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

const PS_TIMEOUT: Duration = Duration::from_secs(20);

/// Settings for a [`ComposeBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// The docker binary.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Compose project name.
    #[serde(default = "default_project")]
    pub project: String,
    /// Compose files; empty means compose's own lookup.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Leave the project running after the run.
    #[serde(default)]
    pub keep: bool,
}

fn default_binary() -> String {
    "docker".to_string()
}

fn default_project() -> String {
    "deploygate".to_string()
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            project: default_project(),
            files: Vec::new(),
            keep: false,
        }
    }
}

/// Brings up compose services one at a time with `up -d --no-deps`.
///
/// Service ordering comes from the stage graph, not from compose.
#[derive(Debug)]
pub struct ComposeBackend {
    name: String,
    config: ComposeConfig,
    touched: AtomicBool,
}

impl ComposeBackend {
    /// Creates a backend from configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ComposeConfig) -> Self {
        Self {
            name: name.into(),
            config,
            touched: AtomicBool::new(false),
        }
    }

    /// `docker compose -p <project> [-f <file>]...`
    fn compose(&self) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.config.binary.clone())
            .args(["compose", "-p", self.config.project.as_str()]);
        for file in &self.config.files {
            cmd = cmd.arg("-f").arg(file.display().to_string());
        }
        cmd
    }

    fn service_for(&self, stage: &StageSpec) -> Option<String> {
        match stage.action_for(&self.name) {
            DeployAction::ComposeService { service } => Some(service.clone()),
            _ => None,
        }
    }

    async fn native_signal(&self, stage: &StageSpec) -> ProbeResult {
        let Some(service) = self.service_for(stage) else {
            return Err(BackendError::probe(
                &stage.name,
                "native probe needs a compose_service action",
            ));
        };
        let output = self
            .compose()
            .args(["ps", "--all", "--format", "json", service.as_str()])
            .timeout(PS_TIMEOUT)
            .output()
            .await
            .map_err(|e| BackendError::probe(&stage.name, e.to_string()))?;
        if !output.success() {
            return Err(BackendError::probe(&stage.name, output.failure_detail()));
        }
        parse_compose_ps(&output.stdout, &service).map_err(|e| BackendError::probe(&stage.name, e))
    }
}

/// Maps `docker compose ps --format json` output for one service to a signal.
///
/// Accepts both the JSON-array form and the one-object-per-line form. A
/// service that exited zero counts as ready (one-shot jobs such as
/// migrations).
///
/// # Errors
///
/// Returns an error if the output cannot be parsed.
pub fn parse_compose_ps(raw: &str, service: &str) -> Result<SignalState, String> {
    let trimmed = raw.trim();
    let entries: Vec<Value> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| format!("unparseable compose ps: {e}"))?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| format!("unparseable compose ps: {e}")))
            .collect::<Result<_, _>>()?
    };

    let Some(entry) = entries
        .iter()
        .find(|e| e.get("Service").and_then(Value::as_str) == Some(service))
    else {
        return Ok(SignalState::pending(format!("service {service} not created")));
    };

    let state = entry.get("State").and_then(Value::as_str).unwrap_or("unknown");
    let health = entry.get("Health").and_then(Value::as_str).unwrap_or("");
    let exit_code = entry.get("ExitCode").and_then(Value::as_i64).unwrap_or(0);

    Ok(match (state, health) {
        ("running", "" | "healthy") => SignalState::Ready,
        ("running", "unhealthy") => SignalState::unhealthy(format!("{service} unhealthy")),
        ("running", other) => SignalState::pending(format!("{service} health: {other}")),
        ("exited", _) if exit_code == 0 => SignalState::Ready,
        ("exited" | "dead", _) => {
            SignalState::unhealthy(format!("{service} {state} (exit code {exit_code})"))
        }
        (other, _) => SignalState::pending(format!("{service} {other}")),
    })
}

#[async_trait]
impl Backend for ComposeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::only(BackendKind::ComposeService)
    }

    async fn is_available(&self) -> bool {
        ToolCommand::new(self.config.binary.clone())
            .args(["compose", "version"])
            .timeout(PS_TIMEOUT)
            .succeeds()
            .await
    }

    async fn execute(&self, stage: &StageSpec) -> ActionResult {
        let action = stage.action_for(&self.name);
        match action {
            DeployAction::ComposeService { service } => {
                self.touched.store(true, Ordering::SeqCst);
                let cmd = self.compose().args(["up", "-d", "--no-deps", service.as_str()]);
                let report = run_tool(&stage.name, &cmd).await?;
                info!(backend = %self.name, stage = %stage.name, service = %service, "compose service up");
                Ok(report)
            }
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
        if self.config.keep || !self.touched.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let cmd = self.compose().args(["down", "--remove-orphans"]);
        run_tool("teardown", &cmd).await.map(|_| ())
    }
}
