//! Per-backend stage scheduling.
//!
//! One [`BackendRun`] drives every stage of the graph on a single backend:
//! availability, prepare, a bounded fan-out of stage tasks in topological
//! position order, and teardown on every exit path.

use super::board::OutcomeBoard;
use super::RunSettings;
use crate::backends::Backend;
use crate::cancellation::{CancellationToken, CleanupRegistry};
use crate::core::{Outcome, OutcomeStatus, SignalState};
use crate::events::{names, EventSink};
use crate::graph::{StageGraph, StageSpec};
use crate::prober::{await_ready, ProbeVerdict};
use crate::report::BackendOutcomes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Runs one backend's share of a run.
pub(crate) struct BackendRun {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) graph: Arc<StageGraph>,
    pub(crate) settings: RunSettings,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) cancel: CancellationToken,
}

impl BackendRun {
    pub(crate) async fn run(self) -> BackendOutcomes {
        let name = self.backend.name().to_string();
        let started = Instant::now();
        let board = OutcomeBoard::new(&name, self.graph.clone());
        let cleanup = CleanupRegistry::new();

        if self.start_backend(&board, &cleanup).await {
            self.schedule(&board).await;
        }
        self.sweep(&board).await;

        let (_, failed) = cleanup.run_all(self.settings.cleanup_timeout()).await;
        let teardown_errors: Vec<String> = failed
            .into_iter()
            .map(|(callback, reason)| {
                warn!(backend = %name, callback = %callback, reason = %reason, "cleanup failed");
                format!("{callback}: {reason}")
            })
            .collect();

        let outcomes = board.snapshot();
        let ready = outcomes.iter().filter(|o| o.status.is_ready()).count();
        info!(backend = %name, ready, total = outcomes.len(), "backend finished");
        self.sink
            .emit(
                names::BACKEND_FINISHED,
                Some(json!({
                    "backend": name,
                    "ready": ready,
                    "total": outcomes.len(),
                    "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
                    "teardown_errors": teardown_errors,
                })),
            )
            .await;

        BackendOutcomes::new(name, outcomes).with_teardown_errors(teardown_errors)
    }

    /// Availability check and prepare. Returns false if no stage may run.
    async fn start_backend(&self, board: &OutcomeBoard, cleanup: &CleanupRegistry) -> bool {
        let name = self.backend.name();

        let available = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            checked = timeout(self.settings.availability_timeout(), self.backend.is_available()) => {
                checked.unwrap_or_else(|_| {
                    warn!(backend = %name, "availability check timed out");
                    false
                })
            }
        };
        if !available {
            self.skip_all(board, format!("backend '{name}' is unavailable")).await;
            return false;
        }

        let prepared = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // prepare may have left partial state behind.
                self.register_teardown(cleanup);
                return false;
            }
            prepared = self.backend.prepare() => prepared,
        };
        if let Err(err) = prepared {
            self.skip_all(board, format!("backend '{name}' failed to prepare: {err}"))
                .await;
            return false;
        }
        self.register_teardown(cleanup);

        debug!(backend = %name, "backend prepared");
        self.sink
            .emit(names::BACKEND_PREPARED, Some(json!({ "backend": name })))
            .await;
        true
    }

    fn register_teardown(&self, cleanup: &CleanupRegistry) {
        let backend = self.backend.clone();
        cleanup.register(format!("teardown:{}", backend.name()), move || async move {
            backend.teardown().await.map_err(|e| e.to_string())
        });
    }

    async fn skip_all(&self, board: &OutcomeBoard, detail: String) {
        let name = self.backend.name();
        warn!(backend = %name, detail = %detail, "skipping backend");
        self.sink
            .emit(
                names::BACKEND_UNAVAILABLE,
                Some(json!({ "backend": name, "detail": detail })),
            )
            .await;
        for &index in self.graph.topo_indices() {
            let outcome = Outcome::skipped(
                self.graph.stage(index).name.clone(),
                name,
                OutcomeStatus::SkippedUnavailable,
                detail.clone(),
            );
            self.finish(board, index, outcome).await;
        }
    }

    /// Launches stages as their dependencies become ready, at most
    /// `concurrency` at a time, until nothing is left to launch.
    async fn schedule(&self, board: &OutcomeBoard) {
        let name = self.backend.name();
        let plan = self.graph.plan_for(name, self.backend.capabilities());
        let concurrency = self.settings.concurrency();

        let mut waiting: Vec<usize> = (0..self.graph.len())
            .map(|i| self.graph.dependencies(i).len())
            .collect();
        let mut resolved = VecDeque::new();
        let mut ready = BTreeSet::new();

        for entry in &plan.unsupported {
            let outcome = Outcome::skipped(
                entry.name.clone(),
                name,
                OutcomeStatus::SkippedUnsupported,
                format!("backend '{name}' does not support {} stages", entry.kind),
            );
            self.finish(board, entry.index, outcome).await;
            resolved.push_back(entry.index);
        }
        for entry in &plan.steps {
            if waiting[entry.index] == 0 {
                ready.insert((self.graph.topo_position(entry.index), entry.index));
            }
        }
        self.propagate(board, &mut resolved, &mut waiting, &mut ready)
            .await;

        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < concurrency && !self.cancel.is_cancelled() {
                let Some((_, index)) = ready.pop_first() else {
                    break;
                };
                if let Err(err) = board.start(index) {
                    warn!(backend = %name, error = %err, "refused to start stage");
                    continue;
                }
                let spec = self.graph.stage(index).clone();
                debug!(backend = %name, stage = %spec.name, "stage running");
                self.sink
                    .emit(
                        names::STAGE_RUNNING,
                        Some(json!({
                            "backend": name,
                            "stage": spec.name,
                            "action": spec.action_for(name).describe(),
                        })),
                    )
                    .await;

                let task = StageTask {
                    backend: self.backend.clone(),
                    stage: spec,
                    precheck: self.settings.precheck,
                    cancel: self.cancel.clone(),
                };
                in_flight.push(track(index, tokio::spawn(task.run())));
            }

            let Some((index, joined)) = in_flight.next().await else {
                break;
            };
            let outcome = joined.unwrap_or_else(|err| {
                warn!(backend = %name, stage = %self.graph.stage(index).name, error = %err, "stage task panicked");
                Outcome::pending(self.graph.stage(index).name.clone(), name)
                    .with_status(OutcomeStatus::Failed)
                    .with_detail(format!("stage task panicked: {err}"))
            });
            self.finish(board, index, outcome).await;
            resolved.push_back(index);
            self.propagate(board, &mut resolved, &mut waiting, &mut ready)
                .await;
        }
    }

    /// Releases dependents of newly terminal stages: ready when every
    /// dependency is ready, skipped as soon as all are terminal otherwise.
    async fn propagate(
        &self,
        board: &OutcomeBoard,
        resolved: &mut VecDeque<usize>,
        waiting: &mut [usize],
        ready: &mut BTreeSet<(usize, usize)>,
    ) {
        while let Some(done) = resolved.pop_front() {
            for &dependent in self.graph.dependents(done) {
                waiting[dependent] = waiting[dependent].saturating_sub(1);
                if waiting[dependent] > 0 || board.is_terminal(dependent) {
                    continue;
                }
                let blocker = self
                    .graph
                    .dependencies(dependent)
                    .iter()
                    .copied()
                    .find(|&dep| !board.status(dep).is_ready());
                match blocker {
                    None => {
                        ready.insert((self.graph.topo_position(dependent), dependent));
                    }
                    Some(dep) => {
                        let outcome = Outcome::skipped(
                            self.graph.stage(dependent).name.clone(),
                            self.backend.name(),
                            OutcomeStatus::SkippedDependencyFailed,
                            format!(
                                "dependency '{}' is {}",
                                self.graph.stage(dep).name,
                                board.status(dep)
                            ),
                        );
                        self.finish(board, dependent, outcome).await;
                        resolved.push_back(dependent);
                    }
                }
            }
        }
    }

    /// Gives every stage still pending a terminal outcome.
    async fn sweep(&self, board: &OutcomeBoard) {
        let reason = self.cancel.reason();
        for &index in self.graph.topo_indices() {
            if board.is_terminal(index) {
                continue;
            }
            let stage = self.graph.stage(index).name.clone();
            let outcome = match &reason {
                Some(reason) => Outcome::skipped(
                    stage,
                    self.backend.name(),
                    OutcomeStatus::TimedOut,
                    format!("cancelled before start: {reason}"),
                ),
                None => Outcome::skipped(
                    stage,
                    self.backend.name(),
                    OutcomeStatus::Failed,
                    "stage was never scheduled",
                ),
            };
            self.finish(board, index, outcome).await;
        }
    }

    /// Records a terminal outcome and reports it.
    async fn finish(&self, board: &OutcomeBoard, index: usize, outcome: Outcome) {
        let event = match outcome.status {
            OutcomeStatus::Ready => names::STAGE_READY,
            OutcomeStatus::TimedOut => names::STAGE_TIMED_OUT,
            status if status.is_skipped() => names::STAGE_SKIPPED,
            _ => names::STAGE_FAILED,
        };
        let payload = stage_payload(&outcome);
        if board.finalize(index, outcome).is_err() {
            return;
        }
        self.sink.emit(event, Some(payload)).await;
    }
}

fn stage_payload(outcome: &Outcome) -> Value {
    json!({
        "backend": outcome.backend,
        "stage": outcome.stage,
        "status": outcome.status,
        "detail": outcome.detail,
        "elapsed_ms": outcome.elapsed_ms(),
        "attempts": outcome.attempts,
        "polls": outcome.polls,
    })
}

fn track(
    index: usize,
    handle: JoinHandle<Outcome>,
) -> impl Future<Output = (usize, Result<Outcome, JoinError>)> {
    async move { (index, handle.await) }
}

/// One stage on one backend, from precheck to readiness.
struct StageTask {
    backend: Arc<dyn Backend>,
    stage: Arc<StageSpec>,
    precheck: bool,
    cancel: CancellationToken,
}

impl StageTask {
    async fn run(self) -> Outcome {
        let started = Instant::now();
        let base = Outcome::pending(self.stage.name.clone(), self.backend.name());
        let mut polls = 0u32;

        if self.precheck {
            polls += 1;
            let signal = tokio::select! {
                biased;
                reason = self.cancel.cancelled() => {
                    return base
                        .with_status(OutcomeStatus::TimedOut)
                        .with_detail(format!("cancelled: {reason}"))
                        .with_elapsed(started.elapsed())
                        .with_counters(0, polls);
                }
                signal = self.backend.probe(&self.stage) => signal,
            };
            if matches!(signal, Ok(SignalState::Ready)) {
                debug!(backend = self.backend.name(), stage = %self.stage.name, "already ready");
                return base
                    .with_status(OutcomeStatus::Ready)
                    .with_detail("already ready")
                    .with_elapsed(started.elapsed())
                    .with_counters(0, polls);
            }
        }

        let mut attempts = 0u32;
        let report = loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                reason = self.cancel.cancelled() => {
                    return base
                        .with_status(OutcomeStatus::TimedOut)
                        .with_detail(format!("cancelled during deploy action: {reason}"))
                        .with_elapsed(started.elapsed())
                        .with_counters(attempts, polls);
                }
                result = self.backend.execute(&self.stage) => result,
            };
            match result {
                Ok(report) => break report,
                Err(err) if err.is_retryable() && self.stage.retry.allows_another(attempts) => {
                    let delay = self.stage.retry.delay_for(attempts - 1);
                    warn!(
                        backend = self.backend.name(),
                        stage = %self.stage.name,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "deploy action failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        reason = self.cancel.cancelled() => {
                            return base
                                .with_status(OutcomeStatus::TimedOut)
                                .with_detail(format!("cancelled while retrying: {reason}"))
                                .with_elapsed(started.elapsed())
                                .with_counters(attempts, polls);
                        }
                        () = sleep(delay) => {}
                    }
                }
                Err(err) => {
                    return base
                        .with_status(OutcomeStatus::Failed)
                        .with_detail(err.to_string())
                        .with_elapsed(started.elapsed())
                        .with_counters(attempts, polls);
                }
            }
        };

        if self.stage.readiness.trust_action {
            let outcome = base
                .with_status(OutcomeStatus::Ready)
                .with_elapsed(started.elapsed())
                .with_counters(attempts, polls);
            return match report.summary {
                Some(summary) => outcome.with_detail(summary),
                None => outcome,
            };
        }

        let verdict = await_ready(&self.stage, self.backend.as_ref(), &self.cancel).await;
        polls += verdict.polls();
        let outcome = base
            .with_elapsed(started.elapsed())
            .with_counters(attempts, polls);
        match verdict {
            ProbeVerdict::Ready { .. } => {
                let outcome = outcome.with_status(OutcomeStatus::Ready);
                match report.summary {
                    Some(summary) => outcome.with_detail(summary),
                    None => outcome,
                }
            }
            ProbeVerdict::TimedOut { detail, .. } => outcome
                .with_status(OutcomeStatus::TimedOut)
                .with_detail(detail),
            ProbeVerdict::Cancelled { reason, .. } => outcome
                .with_status(OutcomeStatus::TimedOut)
                .with_detail(format!("cancelled while waiting for readiness: {reason}")),
        }
    }
}
