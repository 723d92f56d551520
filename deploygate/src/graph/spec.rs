//! Stage specifications: what to deploy, where, and how to tell it is ready.

use super::RetryPolicy;
use crate::core::BackendKind;
use crate::errors::{codes, ConfigError, ErrorInfo};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// The operation a backend performs to deploy a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployAction {
    /// Run a command.
    Command {
        /// Program and arguments.
        argv: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory.
        #[serde(default)]
        cwd: Option<PathBuf>,
        /// Spawn and keep running instead of waiting for exit.
        #[serde(default)]
        detach: bool,
        /// Upper bound for a foreground command.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Start a single container from an image.
    Container {
        /// Image reference.
        image: String,
        /// Container name; defaults to `<prefix>-<stage>`.
        #[serde(default)]
        name: Option<String>,
        /// Port mappings in `host:container` form.
        #[serde(default)]
        ports: Vec<String>,
        /// Environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Arguments passed after the image.
        #[serde(default)]
        args: Vec<String>,
    },
    /// Bring up one service of a compose project.
    ComposeService {
        /// The compose service name.
        service: String,
    },
    /// Apply Kubernetes manifests.
    Manifest {
        /// Manifest files or directories.
        paths: Vec<PathBuf>,
        /// Workload to watch for readiness, e.g. `deployment/api`.
        #[serde(default)]
        workload: Option<String>,
    },
    /// Nothing to deploy; the stage is only probed.
    External,
}

impl DeployAction {
    /// Convenience constructor for a foreground command.
    #[must_use]
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
            detach: false,
            timeout_secs: None,
        }
    }

    /// Short label for logs and plans.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Command { argv, detach, .. } => {
                let prefix = if *detach { "spawn" } else { "run" };
                format!("{prefix} `{}`", argv.join(" "))
            }
            Self::Container { image, .. } => format!("container {image}"),
            Self::ComposeService { service } => format!("compose service {service}"),
            Self::Manifest { paths, .. } => {
                let joined: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                format!("apply {}", joined.join(", "))
            }
            Self::External => "external (probe only)".to_string(),
        }
    }
}

/// How to read a stage's health.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// The backend's own notion of health (container state, replicas, ...).
    #[default]
    Native,
    /// Run a command; healthy on exit 0 and an optional stdout match.
    Command {
        /// Program and arguments.
        argv: Vec<String>,
        /// Regex the stdout must match.
        #[serde(default)]
        expect_stdout: Option<String>,
    },
    /// Healthy once a TCP connection succeeds.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// Healthy once a GET returns the expected status.
    Http {
        /// URL to fetch.
        url: String,
        /// Expected HTTP status.
        #[serde(default = "default_http_status")]
        expect_status: u16,
    },
}

fn default_http_status() -> u16 {
    200
}

/// Readiness criterion for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessCheck {
    /// What to probe.
    pub probe: ProbeTarget,
    /// Delay between polls in milliseconds.
    pub interval_ms: u64,
    /// Readiness budget in seconds.
    pub timeout_secs: u64,
    /// Treat a successful deploy action as ready without polling.
    pub trust_action: bool,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self {
            probe: ProbeTarget::Native,
            interval_ms: 1000,
            timeout_secs: 60,
            trust_action: false,
        }
    }
}

impl ReadinessCheck {
    /// Sets the probe target.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeTarget) -> Self {
        self.probe = probe;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Opts into trusting the deploy action.
    #[must_use]
    pub fn trusting_action(mut self) -> Self {
        self.trust_action = true;
        self
    }

    /// The poll interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The readiness budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Specification for a single deployable stage.
///
/// Immutable once a [`StageGraph`](super::StageGraph) is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The kind of backend the stage needs.
    pub kind: BackendKind,
    /// Names of stages this stage depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// The deploy action.
    pub action: DeployAction,
    /// Per-backend replacements for `action`, keyed by backend name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, DeployAction>,
    /// The readiness criterion.
    #[serde(default)]
    pub readiness: ReadinessCheck,
    /// The retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StageSpec {
    /// Creates a stage with an external (probe-only) action.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: Vec::new(),
            action: DeployAction::External,
            overrides: BTreeMap::new(),
            readiness: ReadinessCheck::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the deploy action.
    #[must_use]
    pub fn with_action(mut self, action: DeployAction) -> Self {
        self.action = action;
        self
    }

    /// Overrides the deploy action on one backend.
    #[must_use]
    pub fn with_override(mut self, backend: impl Into<String>, action: DeployAction) -> Self {
        self.overrides.insert(backend.into(), action);
        self
    }

    /// Sets the readiness check.
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessCheck) -> Self {
        self.readiness = readiness;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The action to run on the named backend.
    #[must_use]
    pub fn action_for(&self, backend: &str) -> &DeployAction {
        self.overrides.get(backend).unwrap_or(&self.action)
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank, the stage depends on itself,
    /// the poll interval is zero, or a command probe's `expect_stdout` is not
    /// a valid regex.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid(&self.name, "Stage name cannot be empty or whitespace-only"));
        }
        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(invalid(
                &self.name,
                &format!("Stage '{}' cannot depend on itself", self.name),
            ));
        }
        if self.readiness.interval_ms == 0 && !self.readiness.trust_action {
            return Err(invalid(
                &self.name,
                &format!("Stage '{}' has a zero readiness interval", self.name),
            ));
        }
        if let ProbeTarget::Command {
            expect_stdout: Some(pattern),
            ..
        } = &self.readiness.probe
        {
            if let Err(e) = Regex::new(pattern) {
                return Err(invalid(
                    &self.name,
                    &format!("Stage '{}' has an invalid expect_stdout pattern: {e}", self.name),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(stage: &str, message: &str) -> ConfigError {
    ConfigError::new(message)
        .with_stages(vec![stage.to_string()])
        .with_error_info(ErrorInfo::new(codes::INVALID_STAGE, message))
}
