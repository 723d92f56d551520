//! Per-backend outcome board.

use crate::core::{Outcome, OutcomeStatus};
use crate::graph::StageGraph;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A rejected state transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The stage already reached a terminal status.
    #[error("stage '{stage}' is already {status}")]
    AlreadyTerminal {
        /// The stage name.
        stage: String,
        /// Its terminal status.
        status: OutcomeStatus,
    },
    /// A dependency has not reached `ready`.
    #[error("stage '{stage}' cannot start: dependency '{dependency}' is {status}")]
    DependencyNotReady {
        /// The stage name.
        stage: String,
        /// The blocking dependency.
        dependency: String,
        /// The dependency's status.
        status: OutcomeStatus,
    },
    /// The stage is not pending.
    #[error("stage '{stage}' cannot start from {status}")]
    NotPending {
        /// The stage name.
        stage: String,
        /// Its status.
        status: OutcomeStatus,
    },
}

/// One outcome slot per stage, written by one task and read by many.
///
/// Terminal outcomes are sticky: a second finalization is rejected.
#[derive(Debug)]
pub struct OutcomeBoard {
    graph: Arc<StageGraph>,
    slots: DashMap<usize, Outcome>,
}

impl OutcomeBoard {
    /// Creates a board with every stage pending.
    #[must_use]
    pub fn new(backend: &str, graph: Arc<StageGraph>) -> Self {
        let slots = graph
            .stages()
            .enumerate()
            .map(|(i, spec)| (i, Outcome::pending(spec.name.clone(), backend)))
            .collect();
        Self { graph, slots }
    }

    /// The status of a stage.
    #[must_use]
    pub fn status(&self, index: usize) -> OutcomeStatus {
        self.slots
            .get(&index)
            .map_or(OutcomeStatus::Pending, |o| o.status)
    }

    /// Returns true if the stage is terminal.
    #[must_use]
    pub fn is_terminal(&self, index: usize) -> bool {
        self.status(index).is_terminal()
    }

    /// Moves a stage to `running`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the stage is pending and every dependency is
    /// ready.
    pub fn start(&self, index: usize) -> Result<(), TransitionError> {
        let stage = self.graph.stage(index).name.clone();
        for &dep in self.graph.dependencies(index) {
            let status = self.status(dep);
            if !status.is_ready() {
                return Err(TransitionError::DependencyNotReady {
                    stage,
                    dependency: self.graph.stage(dep).name.clone(),
                    status,
                });
            }
        }

        let mut slot = self
            .slots
            .get_mut(&index)
            .ok_or_else(|| TransitionError::NotPending {
                stage: stage.clone(),
                status: OutcomeStatus::Pending,
            })?;
        if slot.status != OutcomeStatus::Pending {
            return Err(TransitionError::NotPending {
                stage,
                status: slot.status,
            });
        }
        slot.status = OutcomeStatus::Running;
        Ok(())
    }

    /// Records a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage already has a terminal outcome; the
    /// existing outcome is kept.
    pub fn finalize(&self, index: usize, outcome: Outcome) -> Result<(), TransitionError> {
        debug_assert!(outcome.is_terminal());
        let mut slot = self
            .slots
            .entry(index)
            .or_insert_with(|| Outcome::pending(outcome.stage.clone(), outcome.backend.clone()));
        if slot.is_terminal() {
            warn!(stage = %slot.stage, status = %slot.status, "rejected second finalization");
            return Err(TransitionError::AlreadyTerminal {
                stage: slot.stage.clone(),
                status: slot.status,
            });
        }
        *slot = outcome;
        Ok(())
    }

    /// A copy of one outcome.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Outcome> {
        self.slots.get(&index).map(|o| o.clone())
    }

    /// Every outcome, in topological order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Outcome> {
        self.graph
            .topo_indices()
            .iter()
            .filter_map(|&i| self.get(i))
            .collect()
    }
}
