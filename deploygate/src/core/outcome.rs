//! The result of running one stage on one backend.

use super::OutcomeStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The outcome of one stage on one backend.
///
/// Outcomes are finalized exactly once; the orchestrator's board refuses to
/// overwrite a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// The stage name.
    pub stage: String,
    /// The backend name.
    pub backend: String,
    /// The status.
    pub status: OutcomeStatus,
    /// Wall time from `running` to the terminal status.
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
    /// Diagnostic text; always set for terminal non-ready outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Number of deploy action attempts.
    pub attempts: u32,
    /// Number of readiness polls.
    pub polls: u32,
}

impl Outcome {
    /// Creates a pending outcome.
    #[must_use]
    pub fn pending(stage: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            backend: backend.into(),
            status: OutcomeStatus::Pending,
            elapsed: Duration::ZERO,
            detail: None,
            attempts: 0,
            polls: 0,
        }
    }

    /// Creates a terminal outcome for a stage that never ran.
    #[must_use]
    pub fn skipped(
        stage: impl Into<String>,
        backend: impl Into<String>,
        status: OutcomeStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
            ..Self::pending(stage, backend)
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: OutcomeStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Sets the attempt and poll counters.
    #[must_use]
    pub fn with_counters(mut self, attempts: u32, polls: u32) -> Self {
        self.attempts = attempts;
        self.polls = polls;
        self
    }

    /// Returns true if the outcome is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }
}
