//! Core domain model types for deploygate.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Backend kind and outcome status enums
//! - Backend capability sets
//! - The per-stage outcome record
//! - Typed action and probe results

mod capabilities;
mod outcome;
mod signal;
mod status;

pub use capabilities::Capabilities;
pub use outcome::Outcome;
pub use signal::{ActionReport, ActionResult, ProbeResult, SignalState};
pub use status::{BackendKind, OutcomeStatus};
