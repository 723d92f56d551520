//! Run reports: aggregation and rendering.

mod aggregate;
mod render;

pub use aggregate::{BackendOutcomes, BackendReport, RunReport, StatusCounts, Summary};
pub use render::{render, render_text, ReportFormat};
