//! Orchestration events.
//!
//! The orchestrator reports progress through an [`EventSink`]. Every stage
//! event carries a JSON payload with `backend`, `stage`, `detail` and
//! `elapsed_ms` where they apply.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A run started.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished; carries the summary.
    pub const RUN_FINISHED: &str = "run.finished";
    /// A backend was unavailable or failed to prepare.
    pub const BACKEND_UNAVAILABLE: &str = "backend.unavailable";
    /// A backend passed its availability check and prepared.
    pub const BACKEND_PREPARED: &str = "backend.prepared";
    /// A backend finished all its stages.
    pub const BACKEND_FINISHED: &str = "backend.finished";
    /// A stage entered `running`.
    pub const STAGE_RUNNING: &str = "stage.running";
    /// A stage became ready.
    pub const STAGE_READY: &str = "stage.ready";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage timed out.
    pub const STAGE_TIMED_OUT: &str = "stage.timed_out";
    /// A stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
}
