//! Run cancellation and scoped cleanup.
//!
//! This module provides:
//! - [`CancellationToken`] for cooperative, awaitable cancellation
//! - [`CleanupRegistry`] for LIFO cleanup execution

mod cleanup;
mod token;

pub use cleanup::{CleanupCallback, CleanupRegistry, CleanupResult};
pub use token::{CancelCallback, CancellationToken};
