//! Readiness polling.
//!
//! [`await_ready`] owns the poll loop so that backends only ever answer
//! one-shot probes. Timing uses `tokio::time`, which makes the loop testable
//! under paused time.

use crate::backends::Backend;
use crate::cancellation::CancellationToken;
use crate::core::SignalState;
use crate::graph::StageSpec;
use serde::Serialize;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace};

/// How a readiness wait ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ProbeVerdict {
    /// The stage reported ready.
    Ready {
        /// Probes issued.
        polls: u32,
    },
    /// The budget ran out, or probe errors were exhausted.
    TimedOut {
        /// Probes issued.
        polls: u32,
        /// The last observation.
        detail: String,
    },
    /// The run was cancelled.
    Cancelled {
        /// Probes issued.
        polls: u32,
        /// The cancellation reason.
        reason: String,
    },
}

impl ProbeVerdict {
    /// Number of probes issued.
    #[must_use]
    pub fn polls(&self) -> u32 {
        match self {
            Self::Ready { polls } | Self::TimedOut { polls, .. } | Self::Cancelled { polls, .. } => {
                *polls
            }
        }
    }

    /// Returns true for [`ProbeVerdict::Ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Polls `backend.probe(stage)` until ready, timeout, or cancellation.
///
/// The first `Ready` signal wins. Sleeps are clamped to the remaining budget,
/// so the verdict arrives at the timeout and never more than one interval
/// after it. Probe errors are retried with the stage's retry backoff until
/// `retry.max_attempts` of them occur back to back.
pub async fn await_ready(
    stage: &StageSpec,
    backend: &dyn Backend,
    cancel: &CancellationToken,
) -> ProbeVerdict {
    let interval = stage.readiness.interval();
    let budget = stage.readiness.timeout();
    let deadline = Instant::now() + budget;

    let mut polls = 0u32;
    let mut consecutive_errors = 0u32;
    let mut last = "no signal yet".to_string();

    loop {
        if let Some(reason) = cancel.reason() {
            return ProbeVerdict::Cancelled { polls, reason };
        }

        polls += 1;
        let probe_deadline = deadline.max(Instant::now()) + interval;
        let result = tokio::select! {
            reason = cancel.cancelled() => return ProbeVerdict::Cancelled { polls, reason },
            () = sleep_until(probe_deadline) => {
                return ProbeVerdict::TimedOut {
                    polls,
                    detail: format!("probe did not answer within {budget:?}; last signal: {last}"),
                };
            }
            result = backend.probe(stage) => result,
        };

        let wait = match result {
            Ok(SignalState::Ready) => {
                debug!(backend = backend.name(), stage = %stage.name, polls, "stage ready");
                return ProbeVerdict::Ready { polls };
            }
            Ok(signal) => {
                trace!(backend = backend.name(), stage = %stage.name, signal = %signal, "not ready");
                consecutive_errors = 0;
                last = signal.to_string();
                interval
            }
            Err(err) => {
                consecutive_errors += 1;
                last = format!("probe error: {}", err.detail());
                debug!(
                    backend = backend.name(),
                    stage = %stage.name,
                    consecutive_errors,
                    error = %err,
                    "probe errored"
                );
                if !stage.retry.allows_another(consecutive_errors) {
                    return ProbeVerdict::TimedOut {
                        polls,
                        detail: format!(
                            "probe failed {consecutive_errors} times in a row; {last}"
                        ),
                    };
                }
                stage.retry.delay_for(consecutive_errors - 1)
            }
        };

        let now = Instant::now();
        if now >= deadline {
            return ProbeVerdict::TimedOut {
                polls,
                detail: format!("not ready after {budget:?}; last signal: {last}"),
            };
        }

        tokio::select! {
            reason = cancel.cancelled() => return ProbeVerdict::Cancelled { polls, reason },
            () = sleep(wait.min(deadline - now)) => {}
        }
    }
}
