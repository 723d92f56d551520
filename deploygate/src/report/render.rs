//! Report renderers.

use super::{BackendReport, RunReport};
use crate::core::Outcome;
use crate::errors::DeploygateError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use uuid::Uuid;

/// Output format for a [`RunReport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Human-readable tables.
    #[default]
    Text,
    /// The full report, pretty-printed.
    Json,
    /// One record per stage and backend.
    Jsonl,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        })
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            other => Err(format!("unknown report format '{other}' (text, json, jsonl)")),
        }
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    run_id: Uuid,
    #[serde(flatten)]
    outcome: &'a Outcome,
}

/// Renders a report.
///
/// # Errors
///
/// Returns a serialization error for the JSON formats.
pub fn render(report: &RunReport, format: ReportFormat) -> Result<String, DeploygateError> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        ReportFormat::Jsonl => {
            let mut out = String::new();
            for outcome in report.backends.iter().flat_map(|b| b.outcomes.iter()) {
                let record = JsonlRecord {
                    run_id: report.run_id,
                    outcome,
                };
                out.push_str(&serde_json::to_string(&record)?);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

/// Renders the human-readable form.
#[must_use]
pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "deploygate run {} ({:.1}s)",
        report.run_id,
        duration_secs(report.duration_ms())
    );

    for backend in &report.backends {
        out.push('\n');
        write_backend(&mut out, backend);
    }

    let failures: Vec<&Outcome> = report.failures().collect();
    if !failures.is_empty() {
        out.push_str("\nFailures:\n");
        for outcome in failures {
            let _ = writeln!(
                out,
                "  - [{}] {}: {} - {}",
                outcome.backend,
                outcome.stage,
                outcome.status,
                outcome.detail.as_deref().unwrap_or("no detail")
            );
        }
    }

    let s = &report.summary;
    let _ = writeln!(
        out,
        "\nSummary: {} passed, {} failed, {} skipped, {} total ({:.1}% ready)",
        s.passed, s.failed, s.skipped, s.total, s.success_rate_percent
    );
    out
}

#[allow(clippy::cast_precision_loss)]
fn duration_secs(ms: i64) -> f64 {
    ms.max(0) as f64 / 1000.0
}

fn write_backend(out: &mut String, backend: &BackendReport) {
    let c = &backend.counts;
    let _ = writeln!(
        out,
        "Backend {}: {}/{} ready ({:.1}%)",
        backend.backend, c.ready, c.total, c.success_rate_percent
    );

    let width = backend
        .outcomes
        .iter()
        .map(|o| o.stage.len())
        .max()
        .unwrap_or(0)
        .max("STAGE".len());
    let _ = writeln!(
        out,
        "  {:<width$}  {:<25}  {:>9}  {:>8}  {:>5}",
        "STAGE", "STATUS", "ELAPSED", "ATTEMPTS", "POLLS"
    );
    for o in &backend.outcomes {
        let _ = writeln!(
            out,
            "  {:<width$}  {:<25}  {:>8.1}s  {:>8}  {:>5}",
            o.stage,
            o.status.to_string(),
            o.elapsed.as_secs_f64(),
            o.attempts,
            o.polls
        );
    }
    for err in &backend.teardown_errors {
        let _ = writeln!(out, "  teardown error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutcomeStatus;
    use crate::report::BackendOutcomes;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sample() -> RunReport {
        let now = Utc::now();
        RunReport::aggregate(
            Uuid::new_v4(),
            now,
            now,
            vec![
                BackendOutcomes::new(
                    "local",
                    vec![
                        Outcome::pending("db", "local").with_status(OutcomeStatus::Ready),
                        Outcome::pending("cache", "local")
                            .with_status(OutcomeStatus::Failed)
                            .with_detail("exit code 1: boom"),
                        Outcome::skipped(
                            "app",
                            "local",
                            OutcomeStatus::SkippedDependencyFailed,
                            "dependency 'cache' failed",
                        ),
                    ],
                ),
                BackendOutcomes::new(
                    "kind",
                    vec![Outcome::skipped(
                        "db",
                        "kind",
                        OutcomeStatus::SkippedUnavailable,
                        "backend 'kind' unavailable",
                    )],
                ),
            ],
        )
    }

    #[test]
    fn test_text_lists_every_failure() {
        let text = render(&sample(), ReportFormat::Text).unwrap();
        assert!(text.contains("Backend local: 1/3 ready"));
        assert!(text.contains("Failures:"));
        assert!(text.contains("[local] cache: failed - exit code 1: boom"));
        assert!(text.contains("[local] app: skipped-dependency-failed - dependency 'cache' failed"));
        assert!(text.contains("[kind] db: skipped-unavailable"));
        assert!(text.contains("Summary: 1 passed, 1 failed, 2 skipped, 4 total"));
    }

    #[test]
    fn test_json_round_trips() {
        let report = sample();
        let json = render(&report, ReportFormat::Json).unwrap();
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.summary, report.summary);
    }

    #[test]
    fn test_jsonl_one_record_per_outcome() {
        let report = sample();
        let jsonl = render(&report, ReportFormat::Jsonl).unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 4);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["run_id"], report.run_id.to_string());
        assert_eq!(first["backend"], "local");
        assert_eq!(first["stage"], "db");
        assert_eq!(first["status"], "ready");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("ndjson".parse::<ReportFormat>().unwrap(), ReportFormat::Jsonl);
        assert!("xml".parse::<ReportFormat>().is_err());
        assert_eq!(ReportFormat::default().to_string(), "text");
    }
}
