//! Error types for deploygate.
//!
//! Configuration problems are fatal and surface before a run starts. Backend
//! problems are stage-local and end up inside an `Outcome` instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The umbrella error type for deploygate operations.
#[derive(Debug, Error)]
pub enum DeploygateError {
    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A cycle was detected in the stage graph.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A backend operation failed.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DeploygateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Stable error codes attached to configuration errors.
pub mod codes {
    /// The stage graph contains a cycle.
    pub const CYCLE: &str = "CONFIG-CYCLE";
    /// A stage depends on a stage that does not exist.
    pub const MISSING_DEP: &str = "CONFIG-MISSING-DEP";
    /// Two stages share a name.
    pub const DUPLICATE: &str = "CONFIG-DUPLICATE";
    /// The stage list is empty.
    pub const EMPTY: &str = "CONFIG-EMPTY";
    /// A stage field is invalid.
    pub const INVALID_STAGE: &str = "CONFIG-INVALID-STAGE";
    /// A backend name is not known.
    pub const UNKNOWN_BACKEND: &str = "CONFIG-UNKNOWN-BACKEND";
    /// The configuration file could not be read or parsed.
    pub const PARSE: &str = "CONFIG-PARSE";
}

/// Diagnostic metadata attached to a configuration error.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates error info, pre-filling the fix hint from [`suggestion_for`].
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = suggestion_for(&code).map(String::from);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: BTreeMap::new(),
        }
    }

    /// Replaces the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Returns the default fix hint for a configuration error code.
#[must_use]
pub fn suggestion_for(code: &str) -> Option<&'static str> {
    match code {
        codes::CYCLE => Some(
            "Check depends_on for circular references; remove one edge of the cycle.",
        ),
        codes::MISSING_DEP => Some(
            "Ensure every depends_on entry names a stage declared in the same file. \
             Check for typos in stage names.",
        ),
        codes::DUPLICATE => Some("Stage names must be unique; rename one of the stages."),
        codes::EMPTY => Some("Declare at least one stage under `stages:`."),
        codes::UNKNOWN_BACKEND => Some(
            "Use one of the built-in backends (local, docker, compose, kind, kubernetes) \
             or declare a named backend under `backends:`.",
        ),
        codes::PARSE => Some("Check the file is valid YAML or JSON and matches the schema."),
        _ => None,
    }
}

/// Error raised when the configuration or stage graph is invalid.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if one is attached.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    pub(crate) fn unknown_backend(name: &str) -> Self {
        Self::new(format!("Unknown backend '{name}'")).with_error_info(
            ErrorInfo::new(codes::UNKNOWN_BACKEND, format!("Backend '{name}' is not defined"))
                .with_context_entry("backend", name),
        )
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for ConfigError {
    fn from(err: CycleDetectedError) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Stage graph contains a dependency cycle: {}", err.cycle_path.join(" -> ")),
        );
        Self {
            message: err.to_string(),
            stages: err.cycle_path,
            error_info: Some(info),
        }
    }
}

/// Errors reported by a backend adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend is not usable at all.
    #[error("Backend '{backend}' unavailable: {reason}")]
    Unavailable {
        /// The backend name.
        backend: String,
        /// Why the backend cannot be used.
        reason: String,
    },

    /// The deploy action itself errored.
    #[error("Deploy action for '{stage}' failed: {detail}")]
    ActionFailed {
        /// The stage name.
        stage: String,
        /// Diagnostic detail.
        detail: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },

    /// A transient probe failure.
    #[error("Probe for '{stage}' errored: {detail}")]
    ProbeError {
        /// The stage name.
        stage: String,
        /// Diagnostic detail.
        detail: String,
    },
}

impl BackendError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Creates a non-retryable action failure.
    #[must_use]
    pub fn action_failed(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ActionFailed {
            stage: stage.into(),
            detail: detail.into(),
            retryable: false,
        }
    }

    /// Creates a retryable action failure.
    #[must_use]
    pub fn action_failed_retryable(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ActionFailed {
            stage: stage.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    /// Creates a probe error.
    #[must_use]
    pub fn probe(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ProbeError {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Returns true if the failed operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ActionFailed { retryable, .. } => *retryable,
            Self::ProbeError { .. } => true,
            Self::Unavailable { .. } => false,
        }
    }

    /// Returns the diagnostic text without the error-kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Unavailable { reason, .. } => reason,
            Self::ActionFailed { detail, .. } | Self::ProbeError { detail, .. } => detail,
        }
    }
}
