//! Backend kind and outcome status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of execution target a stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// A bare local process.
    Process,
    /// A single container.
    Container,
    /// A service inside a compose stack.
    #[serde(alias = "compose_service")]
    ComposeService,
    /// A workload on a Kubernetes cluster.
    #[serde(alias = "cluster_workload")]
    ClusterWorkload,
}

impl BackendKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Process,
        Self::Container,
        Self::ComposeService,
        Self::ClusterWorkload,
    ];
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Process
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Container => write!(f, "container"),
            Self::ComposeService => write!(f, "compose-service"),
            Self::ClusterWorkload => write!(f, "cluster-workload"),
        }
    }
}

/// The status of one stage on one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    /// Waiting for dependencies or a worker slot.
    Pending,
    /// Deploy action or readiness polling in progress.
    Running,
    /// Deployed and healthy.
    Ready,
    /// The deploy action failed.
    Failed,
    /// Readiness was not reached in time, or the run was cancelled.
    TimedOut,
    /// A dependency did not become ready.
    SkippedDependencyFailed,
    /// The backend cannot execute this stage's kind.
    SkippedUnsupported,
    /// The backend was unavailable for the whole run.
    SkippedUnavailable,
}

impl Default for OutcomeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::SkippedDependencyFailed => "skipped-dependency-failed",
            Self::SkippedUnsupported => "skipped-unsupported",
            Self::SkippedUnavailable => "skipped-unavailable",
        };
        f.write_str(label)
    }
}

impl OutcomeStatus {
    /// Returns true if the status can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the stage reached readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true for failures that count against the success rate.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Returns true for any skipped status.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::SkippedDependencyFailed | Self::SkippedUnsupported | Self::SkippedUnavailable
        )
    }
}
