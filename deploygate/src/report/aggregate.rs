//! Folding outcomes into a run report.

use crate::core::{Outcome, OutcomeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything one backend produced during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcomes {
    /// The backend name.
    pub backend: String,
    /// One outcome per stage, in topological order.
    pub outcomes: Vec<Outcome>,
    /// Cleanup callbacks that failed, as `name: reason`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

impl BackendOutcomes {
    /// Creates an entry with no teardown errors.
    #[must_use]
    pub fn new(backend: impl Into<String>, outcomes: Vec<Outcome>) -> Self {
        Self {
            backend: backend.into(),
            outcomes,
            teardown_errors: Vec::new(),
        }
    }

    /// Attaches teardown failures.
    #[must_use]
    pub fn with_teardown_errors(mut self, errors: Vec<String>) -> Self {
        self.teardown_errors = errors;
        self
    }
}

/// Per-backend status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Stages that reached ready.
    pub ready: usize,
    /// Stages whose action failed.
    pub failed: usize,
    /// Stages that timed out or were cancelled.
    pub timed_out: usize,
    /// Stages skipped for any reason.
    pub skipped: usize,
    /// All stages.
    pub total: usize,
    /// `ready / total`, as a percentage.
    pub success_rate_percent: f64,
}

impl StatusCounts {
    /// Counts a slice of outcomes.
    #[must_use]
    pub fn tally(outcomes: &[Outcome]) -> Self {
        let mut counts = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Ready => counts.ready += 1,
                OutcomeStatus::Failed => counts.failed += 1,
                OutcomeStatus::TimedOut => counts.timed_out += 1,
                status if status.is_skipped() => counts.skipped += 1,
                // Never terminal; counted as a failure if one leaks through.
                _ => counts.failed += 1,
            }
        }
        counts.success_rate_percent = percent(counts.ready, counts.total);
        counts
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// The report for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReport {
    /// The backend name.
    pub backend: String,
    /// Status counts.
    pub counts: StatusCounts,
    /// One outcome per stage.
    pub outcomes: Vec<Outcome>,
    /// Cleanup failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

impl BackendReport {
    /// Returns true if every stage is ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.counts.total > 0 && self.counts.ready == self.counts.total
    }
}

/// Totals across backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Ready outcomes.
    pub passed: usize,
    /// Failed and timed-out outcomes.
    pub failed: usize,
    /// Skipped outcomes.
    pub skipped: usize,
    /// All outcomes.
    pub total: usize,
    /// `passed / total`, as a percentage.
    pub success_rate_percent: f64,
}

/// The aggregated result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Per-backend reports, in selection order.
    pub backends: Vec<BackendReport>,
    /// Totals.
    pub summary: Summary,
}

impl RunReport {
    /// Builds a report from per-backend outcomes.
    #[must_use]
    pub fn aggregate(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        backend_runs: Vec<BackendOutcomes>,
    ) -> Self {
        let mut summary = Summary::default();
        let backends: Vec<BackendReport> = backend_runs
            .into_iter()
            .map(|run| {
                let counts = StatusCounts::tally(&run.outcomes);
                summary.passed += counts.ready;
                summary.failed += counts.failed + counts.timed_out;
                summary.skipped += counts.skipped;
                summary.total += counts.total;
                BackendReport {
                    backend: run.backend,
                    counts,
                    outcomes: run.outcomes,
                    teardown_errors: run.teardown_errors,
                }
            })
            .collect();
        summary.success_rate_percent = percent(summary.passed, summary.total);

        Self {
            run_id,
            started_at,
            finished_at,
            backends,
            summary,
        }
    }

    /// Wall time of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Every outcome that is not ready, across backends.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.backends
            .iter()
            .flat_map(|b| b.outcomes.iter())
            .filter(|o| !o.status.is_ready())
    }

    /// Looks up one outcome.
    #[must_use]
    pub fn outcome(&self, backend: &str, stage: &str) -> Option<&Outcome> {
        self.backends
            .iter()
            .find(|b| b.backend == backend)?
            .outcomes
            .iter()
            .find(|o| o.stage == stage)
    }

    /// Process exit code: `0` all ready, `3` nothing ready, `1` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if !self.backends.is_empty() && self.backends.iter().all(BackendReport::all_ready) {
            0
        } else if self.summary.passed == 0 {
            3
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outcome(stage: &str, backend: &str, status: OutcomeStatus) -> Outcome {
        Outcome::pending(stage, backend).with_status(status)
    }

    fn report(runs: Vec<BackendOutcomes>) -> RunReport {
        let now = Utc::now();
        RunReport::aggregate(Uuid::new_v4(), now, now, runs)
    }

    #[test]
    fn test_all_ready_exit_zero() {
        let report = report(vec![BackendOutcomes::new(
            "local",
            vec![
                outcome("db", "local", OutcomeStatus::Ready),
                outcome("app", "local", OutcomeStatus::Ready),
            ],
        )]);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.summary.passed, 2);
        assert!((report.summary.success_rate_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn test_partial_counts() {
        let report = report(vec![BackendOutcomes::new(
            "local",
            vec![
                outcome("db", "local", OutcomeStatus::Ready),
                outcome("cache", "local", OutcomeStatus::Failed),
                outcome("app", "local", OutcomeStatus::SkippedDependencyFailed),
            ],
        )]);
        let counts = report.backends[0].counts;
        assert_eq!((counts.ready, counts.failed, counts.skipped, counts.total), (1, 1, 1, 3));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures().count(), 2);
    }

    #[test]
    fn test_timed_out_counts_as_failed_in_summary() {
        let report = report(vec![
            BackendOutcomes::new("a", vec![outcome("db", "a", OutcomeStatus::TimedOut)]),
            BackendOutcomes::new("b", vec![outcome("db", "b", OutcomeStatus::SkippedUnavailable)]),
        ]);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.backends[0].counts.timed_out, 1);
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn test_one_backend_unavailable_is_partial() {
        let report = report(vec![
            BackendOutcomes::new("a", vec![outcome("db", "a", OutcomeStatus::Ready)]),
            BackendOutcomes::new("b", vec![outcome("db", "b", OutcomeStatus::SkippedUnavailable)]),
        ]);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.outcome("b", "db").map(|o| o.status),
            Some(OutcomeStatus::SkippedUnavailable)
        );
    }

    #[test]
    fn test_empty_report() {
        let report = report(Vec::new());
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn test_report_serializes() {
        let report = report(vec![BackendOutcomes::new(
            "local",
            vec![outcome("db", "local", OutcomeStatus::Ready)],
        )
        .with_teardown_errors(vec!["teardown:local: timed out".to_string()])]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["passed"], 1);
        assert_eq!(json["backends"][0]["counts"]["ready"], 1);
        assert_eq!(json["backends"][0]["outcomes"][0]["status"], "ready");
        assert_eq!(json["backends"][0]["teardown_errors"][0], "teardown:local: timed out");
    }
}
