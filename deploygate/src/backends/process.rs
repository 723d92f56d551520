//! Bare-process backend.

use super::{probe_target, run_command_action, unsupported_action, Backend, ToolCommand};
use crate::core::{ActionReport, ActionResult, BackendKind, Capabilities, ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::{DeployAction, ProbeTarget, StageSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Settings for a [`LocalProcessBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {}

/// Runs `command` actions as local processes.
///
/// Detached commands are kept as children until teardown. The native probe
/// reports a detached child as ready while it is running, and a foreground
/// command as ready once it exited zero.
#[derive(Debug)]
pub struct LocalProcessBackend {
    name: String,
    children: Mutex<HashMap<String, Child>>,
    finished: Mutex<HashMap<String, Result<(), String>>>,
}

impl LocalProcessBackend {
    /// Creates a backend with the given instance name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a backend from configuration.
    #[must_use]
    pub fn from_config(name: impl Into<String>, _config: &LocalConfig) -> Self {
        Self::new(name)
    }

    /// Number of detached children currently tracked.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    fn spawn_detached(&self, stage: &StageSpec, action: &DeployAction) -> ActionResult {
        let DeployAction::Command { argv, env, cwd, .. } = action else {
            return Err(unsupported_action(&stage.name, &self.name, action));
        };
        let Some(cmd) = ToolCommand::from_argv(argv) else {
            return Err(BackendError::action_failed(&stage.name, "command argv is empty"));
        };
        let cmd = cmd.envs(env).current_dir(cwd.clone());
        let child = cmd
            .spawn()
            .map_err(|e| BackendError::action_failed(&stage.name, e.to_string()))?;
        let pid = child.id();

        if let Some(mut previous) = self.children.lock().insert(stage.name.clone(), child) {
            warn!(backend = %self.name, stage = %stage.name, "replacing previous child");
            let _ = previous.start_kill();
        }
        info!(backend = %self.name, stage = %stage.name, pid = ?pid, "spawned detached process");
        Ok(ActionReport::with_summary(
            pid.map_or_else(|| "spawned".to_string(), |p| format!("pid {p}")),
        ))
    }

    fn native_signal(&self, stage: &StageSpec) -> ProbeResult {
        if let Some(child) = self.children.lock().get_mut(&stage.name) {
            return match child.try_wait() {
                Ok(None) => Ok(SignalState::Ready),
                Ok(Some(status)) => Ok(SignalState::unhealthy(format!("process exited: {status}"))),
                Err(e) => Err(BackendError::probe(&stage.name, e.to_string())),
            };
        }
        match self.finished.lock().get(&stage.name) {
            Some(Ok(())) => Ok(SignalState::Ready),
            Some(Err(detail)) => Ok(SignalState::unhealthy(detail.clone())),
            None => Ok(SignalState::pending("not started")),
        }
    }
}

impl Default for LocalProcessBackend {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl Backend for LocalProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::only(BackendKind::Process)
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, stage: &StageSpec) -> ActionResult {
        let action = stage.action_for(&self.name);
        match action {
            DeployAction::Command { detach: true, .. } => self.spawn_detached(stage, action),
            DeployAction::Command { .. } => {
                let result = run_command_action(&stage.name, action).await;
                let record = result
                    .as_ref()
                    .map(|_| ())
                    .map_err(|e| e.detail().to_string());
                self.finished.lock().insert(stage.name.clone(), record);
                result
            }
            DeployAction::External => Ok(ActionReport::empty()),
            other => Err(unsupported_action(&stage.name, &self.name, other)),
        }
    }

    async fn probe(&self, stage: &StageSpec) -> ProbeResult {
        match &stage.readiness.probe {
            ProbeTarget::Native => self.native_signal(stage),
            target => probe_target(&stage.name, target).await,
        }
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let children: Vec<(String, Child)> = self.children.lock().drain().collect();
        for (stage, mut child) in children {
            debug!(backend = %self.name, stage = %stage, "stopping detached process");
            if let Err(e) = child.kill().await {
                warn!(backend = %self.name, stage = %stage, error = %e, "failed to stop process");
            }
        }
        self.finished.lock().clear();
        Ok(())
    }
}
