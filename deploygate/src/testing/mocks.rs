//! Scripted backends for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backends::Backend;
use crate::core::{ActionReport, ActionResult, Capabilities, ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::StageSpec;

/// A call made against a [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `is_available`.
    IsAvailable,
    /// `prepare`.
    Prepare,
    /// `execute` for a stage.
    Execute(String),
    /// `probe` for a stage.
    Probe(String),
    /// `teardown`.
    Teardown,
}

#[derive(Debug, Clone)]
struct StageScript {
    ready_after: u32,
    never_ready: bool,
    failure: Option<String>,
    flaky: u32,
    delay: Duration,
    probe_error: Option<String>,
    panics: bool,
}

impl Default for StageScript {
    fn default() -> Self {
        Self {
            ready_after: 1,
            never_ready: false,
            failure: None,
            flaky: 0,
            delay: Duration::ZERO,
            probe_error: None,
            panics: false,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, StageScript>,
    /// Probes answered since the last successful deploy.
    deployed: HashMap<String, u32>,
    healthy: HashSet<String>,
    calls: Vec<BackendCall>,
}

/// An in-memory backend driven by per-stage scripts.
///
/// By default every stage deploys successfully and reports ready on the
/// first probe after its deploy action. Health persists across runs, so a
/// second run against the same instance sees an already-healthy
/// environment.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    capabilities: Capabilities,
    available: bool,
    availability_delay: Duration,
    prepare_error: Option<String>,
    teardown_error: Option<String>,
    state: Mutex<State>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    /// Creates an available backend that supports every kind.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::all(),
            available: true,
            availability_delay: Duration::ZERO,
            prepare_error: None,
            teardown_error: None,
            state: Mutex::new(State::default()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Restricts the supported kinds.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Reports unavailable.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Delays the availability answer.
    #[must_use]
    pub fn with_availability_delay(mut self, delay: Duration) -> Self {
        self.availability_delay = delay;
        self
    }

    /// Fails `prepare`.
    #[must_use]
    pub fn with_prepare_error(mut self, detail: impl Into<String>) -> Self {
        self.prepare_error = Some(detail.into());
        self
    }

    /// Fails `teardown`.
    #[must_use]
    pub fn with_teardown_error(mut self, detail: impl Into<String>) -> Self {
        self.teardown_error = Some(detail.into());
        self
    }

    fn script(self, stage: &str, edit: impl FnOnce(&mut StageScript)) -> Self {
        edit(self.state.lock().scripts.entry(stage.to_string()).or_default());
        self
    }

    /// Reports ready on the `polls`-th probe after deploy.
    #[must_use]
    pub fn with_ready_after(self, stage: &str, polls: u32) -> Self {
        self.script(stage, |s| s.ready_after = polls.max(1))
    }

    /// Never reports ready.
    #[must_use]
    pub fn never_ready(self, stage: &str) -> Self {
        self.script(stage, |s| s.never_ready = true)
    }

    /// Fails the deploy action permanently.
    #[must_use]
    pub fn with_failing_action(self, stage: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.script(stage, |s| s.failure = Some(detail))
    }

    /// Fails the deploy action `failures` times with a retryable error.
    #[must_use]
    pub fn with_flaky_action(self, stage: &str, failures: u32) -> Self {
        self.script(stage, |s| s.flaky = failures)
    }

    /// Makes the deploy action take `delay`.
    #[must_use]
    pub fn with_action_delay(self, stage: &str, delay: Duration) -> Self {
        self.script(stage, |s| s.delay = delay)
    }

    /// Makes every probe error.
    #[must_use]
    pub fn with_probe_error(self, stage: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.script(stage, |s| s.probe_error = Some(detail))
    }

    /// Panics inside the deploy action.
    #[must_use]
    pub fn with_panicking_action(self, stage: &str) -> Self {
        self.script(stage, |s| s.panics = true)
    }

    /// Marks a stage healthy before any run.
    #[must_use]
    pub fn already_healthy(self, stage: &str) -> Self {
        self.state.lock().healthy.insert(stage.to_string());
        self
    }

    /// Every call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `execute` calls for a stage.
    #[must_use]
    pub fn execute_count(&self, stage: &str) -> usize {
        self.count(|c| matches!(c, BackendCall::Execute(s) if s == stage))
    }

    /// Number of `probe` calls for a stage.
    #[must_use]
    pub fn probe_count(&self, stage: &str) -> usize {
        self.count(|c| matches!(c, BackendCall::Probe(s) if s == stage))
    }

    /// Number of `execute` calls overall.
    #[must_use]
    pub fn total_executes(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::Execute(_)))
    }

    /// Number of `probe` calls overall.
    #[must_use]
    pub fn total_probes(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::Probe(_)))
    }

    /// Number of `teardown` calls.
    #[must_use]
    pub fn teardown_count(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::Teardown))
    }

    /// Highest number of deploy actions observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Clears the call log.
    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: BackendCall) {
        self.state.lock().calls.push(call);
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn is_available(&self) -> bool {
        self.record(BackendCall::IsAvailable);
        if !self.availability_delay.is_zero() {
            tokio::time::sleep(self.availability_delay).await;
        }
        self.available
    }

    async fn prepare(&self) -> Result<(), BackendError> {
        self.record(BackendCall::Prepare);
        match &self.prepare_error {
            Some(detail) => Err(BackendError::unavailable(&self.name, detail.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, stage: &StageSpec) -> ActionResult {
        let script = {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::Execute(stage.name.clone()));
            state.scripts.get(&stage.name).cloned().unwrap_or_default()
        };

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.running);

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.panics {
            panic!("scripted panic in '{}'", stage.name);
        }

        let mut state = self.state.lock();
        if script.flaky > 0 {
            if let Some(s) = state.scripts.get_mut(&stage.name) {
                s.flaky -= 1;
            }
            return Err(BackendError::action_failed_retryable(
                &stage.name,
                "transient failure",
            ));
        }
        if let Some(detail) = script.failure {
            return Err(BackendError::action_failed(&stage.name, detail));
        }
        state.deployed.insert(stage.name.clone(), 0);
        Ok(ActionReport::with_summary(format!("deployed {}", stage.name)))
    }

    async fn probe(&self, stage: &StageSpec) -> ProbeResult {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Probe(stage.name.clone()));
        let script = state.scripts.get(&stage.name).cloned().unwrap_or_default();

        if let Some(detail) = script.probe_error {
            return Err(BackendError::probe(&stage.name, detail));
        }
        if state.healthy.contains(&stage.name) {
            return Ok(SignalState::Ready);
        }
        let Some(polls) = state.deployed.get_mut(&stage.name) else {
            return Ok(SignalState::pending("not deployed"));
        };
        *polls += 1;
        if script.never_ready || *polls < script.ready_after {
            return Ok(SignalState::pending(format!("starting ({polls} polls)")));
        }
        state.healthy.insert(stage.name.clone());
        Ok(SignalState::Ready)
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        self.record(BackendCall::Teardown);
        match &self.teardown_error {
            Some(detail) => Err(BackendError::action_failed("teardown", detail.clone())),
            None => Ok(()),
        }
    }
}
