//! Typed results returned by backend adapters.

use crate::errors::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The one-shot health signal of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SignalState {
    /// The stage is healthy.
    Ready,
    /// The stage is coming up.
    Pending(String),
    /// The stage is up but reports itself unhealthy.
    Unhealthy(String),
}

impl SignalState {
    /// Creates a pending signal.
    #[must_use]
    pub fn pending(detail: impl Into<String>) -> Self {
        Self::Pending(detail.into())
    }

    /// Creates an unhealthy signal.
    #[must_use]
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self::Unhealthy(detail.into())
    }

    /// Returns true for an unambiguous healthy signal.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Pending(detail) => write!(f, "pending ({detail})"),
            Self::Unhealthy(detail) => write!(f, "unhealthy ({detail})"),
        }
    }
}

/// What a successful deploy action reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Short human-readable summary (e.g. container id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ActionReport {
    /// Creates an empty report.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a report with a summary.
    #[must_use]
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
        }
    }
}

/// Result of a deploy action.
pub type ActionResult = Result<ActionReport, BackendError>;

/// Result of a one-shot probe.
pub type ProbeResult = Result<SignalState, BackendError>;
