//! End-to-end orchestration tests against scripted backends.

use super::*;
use crate::backends::MockBackend;
use crate::core::{BackendKind, Capabilities};
use crate::events::CollectingEventSink;
use crate::graph::{ReadinessCheck, StageSpec};
use crate::testing::{graph_from_edges, scenario_graph, test_stage, ScriptedBackend};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tokio::time::Instant;

fn settings() -> RunSettings {
    RunSettings::default().with_deadline(None)
}

async fn run_one(
    graph: StageGraph,
    backend: &Arc<ScriptedBackend>,
    settings: RunSettings,
) -> (RunReport, Arc<CollectingEventSink>) {
    let sink = Arc::new(CollectingEventSink::new());
    let report = Orchestrator::new(settings)
        .with_event_sink(sink.clone())
        .run(Arc::new(graph), vec![backend.clone() as Arc<dyn Backend>])
        .await;
    (report, sink)
}

fn status(report: &RunReport, backend: &str, stage: &str) -> OutcomeStatus {
    report
        .outcome(backend, stage)
        .map_or(OutcomeStatus::Pending, |o| o.status)
}

fn position(timeline: &[(String, String)], event: &str, stage: &str) -> Option<usize> {
    timeline
        .iter()
        .position(|(e, s)| e == event && s == stage)
}

#[tokio::test(start_paused = true)]
async fn test_all_stages_ready() {
    let backend = Arc::new(
        ScriptedBackend::new("local")
            .with_ready_after("db", 2)
            .with_ready_after("cache", 2)
            .with_ready_after("app", 2),
    );

    let (report, sink) = run_one(scenario_graph(), &backend, settings()).await;

    assert_eq!(report.summary.passed, 3);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(backend.total_executes(), 3);
    assert_eq!(backend.teardown_count(), 1);

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some(names::RUN_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(names::RUN_FINISHED));

    let timeline = sink.stage_timeline("local");
    let app_running = position(&timeline, names::STAGE_RUNNING, "app").unwrap();
    assert!(position(&timeline, names::STAGE_READY, "db").unwrap() < app_running);
    assert!(position(&timeline, names::STAGE_READY, "cache").unwrap() < app_running);
}

#[tokio::test(start_paused = true)]
async fn test_failed_dependency_skips_dependent() {
    let backend = Arc::new(ScriptedBackend::new("local").with_failing_action("cache", "image not found"));

    let (report, _) = run_one(scenario_graph(), &backend, settings()).await;

    assert_eq!(status(&report, "local", "db"), OutcomeStatus::Ready);
    assert_eq!(status(&report, "local", "cache"), OutcomeStatus::Failed);
    assert_eq!(status(&report, "local", "app"), OutcomeStatus::SkippedDependencyFailed);

    let counts = report.backends[0].counts;
    assert_eq!((counts.ready, counts.failed, counts.skipped), (1, 1, 1));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(backend.execute_count("app"), 0);

    let cache = report.outcome("local", "cache").unwrap();
    assert!(cache.detail.as_deref().unwrap().contains("image not found"));
    let app = report.outcome("local", "app").unwrap();
    assert!(app.detail.as_deref().unwrap().contains("'cache'"));
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_backend_does_not_block_others() {
    let healthy = Arc::new(ScriptedBackend::new("local"));
    let down = Arc::new(ScriptedBackend::new("kind").unavailable());
    let sink = Arc::new(CollectingEventSink::new());

    let report = Orchestrator::new(settings())
        .with_event_sink(sink.clone())
        .run(
            Arc::new(scenario_graph()),
            vec![healthy.clone() as Arc<dyn Backend>, down.clone() as Arc<dyn Backend>],
        )
        .await;

    assert!(report.backends[0].all_ready());
    assert!(report.backends[1]
        .outcomes
        .iter()
        .all(|o| o.status == OutcomeStatus::SkippedUnavailable));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(down.total_executes() + down.total_probes(), 0);
    assert_eq!(down.teardown_count(), 0);
    assert_eq!(sink.events_of_type(names::BACKEND_UNAVAILABLE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_backend_never_touched() {
    let mut mock = MockBackend::new();
    mock.expect_name().return_const("kind".to_string());
    mock.expect_capabilities().return_const(Capabilities::all());
    mock.expect_is_available().times(1).returning(|| false);
    mock.expect_prepare().never();
    mock.expect_execute().never();
    mock.expect_probe().never();
    mock.expect_teardown().never();
    let mock = Arc::new(mock);

    let report = Orchestrator::new(settings())
        .run(Arc::new(scenario_graph()), vec![mock.clone() as Arc<dyn Backend>])
        .await;

    assert_eq!(report.summary.skipped, 3);
    assert_eq!(report.exit_code(), 3);
    drop(mock);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_idempotent() {
    let backend = Arc::new(ScriptedBackend::new("local"));
    let graph = Arc::new(scenario_graph());
    let orchestrator = Orchestrator::new(settings());

    let first = orchestrator
        .run(graph.clone(), vec![backend.clone() as Arc<dyn Backend>])
        .await;
    assert_eq!(first.exit_code(), 0);
    backend.reset_calls();

    let second = orchestrator
        .run(graph, vec![backend.clone() as Arc<dyn Backend>])
        .await;
    assert_eq!(second.exit_code(), 0);
    assert_eq!(backend.total_executes(), 0);
    for stage in ["db", "cache", "app"] {
        assert_eq!(backend.probe_count(stage), 1);
        let outcome = second.outcome("local", stage).unwrap();
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.detail.as_deref(), Some("already ready"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_never_healthy_times_out_at_budget() {
    let graph = StageGraph::build([test_stage("db").with_readiness(
        ReadinessCheck::default()
            .with_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(5)),
    )])
    .unwrap();
    let backend = Arc::new(ScriptedBackend::new("local").never_ready("db"));

    let started = Instant::now();
    let (report, _) = run_one(graph, &backend, settings()).await;
    let elapsed = started.elapsed();

    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::TimedOut);
    assert!(db.elapsed >= Duration::from_secs(5));
    assert!(db.elapsed <= Duration::from_secs(6));
    assert!(elapsed <= Duration::from_secs(6));
    assert!(db.detail.as_deref().unwrap().contains("not ready after"));
    assert_eq!(report.exit_code(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_and_tears_down() {
    let graph = StageGraph::build([
        test_stage("db"),
        test_stage("app").with_dependency("db"),
    ])
    .unwrap();
    let backend = Arc::new(ScriptedBackend::new("local").never_ready("db"));

    let started = Instant::now();
    let (report, _) = run_one(
        graph,
        &backend,
        settings().with_deadline(Some(Duration::from_secs(3))),
    )
    .await;

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::TimedOut);
    assert!(db.detail.as_deref().unwrap().contains("deadline"));
    assert!(report.outcome("local", "app").unwrap().is_terminal());
    assert_eq!(backend.execute_count("app"), 0);
    assert_eq!(backend.teardown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_interrupts_run() {
    let graph = StageGraph::build([test_stage("db")]).unwrap();
    let backend = Arc::new(ScriptedBackend::new("local").never_ready("db"));
    let token = CancellationToken::new();
    let _timer = token.cancel_after(Duration::from_secs(2), "interrupted");

    let report = Orchestrator::new(settings())
        .run_with_token(
            Arc::new(graph),
            vec![backend.clone() as Arc<dyn Backend>],
            token,
        )
        .await;

    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::TimedOut);
    assert!(db.detail.as_deref().unwrap().contains("interrupted"));
    assert_eq!(backend.teardown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let backend = Arc::new(ScriptedBackend::new("local"));
    let token = CancellationToken::new();
    token.cancel("interrupted");

    let report = Orchestrator::new(settings())
        .run_with_token(
            Arc::new(scenario_graph()),
            vec![backend.clone() as Arc<dyn Backend>],
            token,
        )
        .await;

    for outcome in &report.backends[0].outcomes {
        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert!(outcome.detail.as_deref().unwrap().starts_with("cancelled before start"));
    }
    assert_eq!(backend.total_executes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_prepare_failure_skips_backend() {
    let backend = Arc::new(ScriptedBackend::new("kind").with_prepare_error("cluster create failed"));

    let (report, sink) = run_one(scenario_graph(), &backend, settings()).await;

    for outcome in &report.backends[0].outcomes {
        assert_eq!(outcome.status, OutcomeStatus::SkippedUnavailable);
        assert!(outcome.detail.as_deref().unwrap().contains("failed to prepare"));
    }
    assert_eq!(backend.total_executes(), 0);
    assert_eq!(backend.teardown_count(), 0);
    assert_eq!(sink.events_of_type(names::STAGE_SKIPPED).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_availability_check_is_bounded() {
    let backend = Arc::new(ScriptedBackend::new("docker").with_availability_delay(Duration::from_secs(60)));

    let started = Instant::now();
    let (report, _) = run_one(
        scenario_graph(),
        &backend,
        settings().with_availability_timeout(Duration::from_secs(15)),
    )
    .await;

    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(report.summary.skipped, 3);
}

async fn peak_with(concurrency: usize) -> usize {
    let graph = StageGraph::build([test_stage("a"), test_stage("b"), test_stage("c")]).unwrap();
    let backend = Arc::new(
        ScriptedBackend::new("local")
            .with_action_delay("a", Duration::from_secs(1))
            .with_action_delay("b", Duration::from_secs(1))
            .with_action_delay("c", Duration::from_secs(1)),
    );
    let (report, _) = run_one(graph, &backend, settings().with_concurrency(concurrency)).await;
    assert_eq!(report.exit_code(), 0);
    backend.peak_concurrency()
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    assert_eq!(peak_with(1).await, 1);
    assert_eq!(peak_with(2).await, 2);
    assert_eq!(peak_with(3).await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_one_runs_in_topological_order() {
    let backend = Arc::new(ScriptedBackend::new("local"));
    let (_, sink) = run_one(scenario_graph(), &backend, settings().with_concurrency(1)).await;

    let running: Vec<String> = sink
        .stage_timeline("local")
        .into_iter()
        .filter(|(e, _)| e == names::STAGE_RUNNING)
        .map(|(_, s)| s)
        .collect();
    let expected: Vec<String> = scenario_graph().topo_order().map(|s| s.name.clone()).collect();
    assert_eq!(running, expected);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_are_retried() {
    let backend = Arc::new(ScriptedBackend::new("local").with_flaky_action("db", 2));
    let graph = StageGraph::build([test_stage("db")]).unwrap();

    let (report, _) = run_one(graph, &backend, settings()).await;

    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::Ready);
    assert_eq!(db.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let backend = Arc::new(ScriptedBackend::new("local").with_flaky_action("db", 5));
    let graph = StageGraph::build([test_stage("db")]).unwrap();

    let (report, _) = run_one(graph, &backend, settings()).await;

    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::Failed);
    assert_eq!(db.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_stage_becomes_failure() {
    let backend = Arc::new(ScriptedBackend::new("local").with_panicking_action("cache"));

    let (report, _) = run_one(scenario_graph(), &backend, settings()).await;

    let cache = report.outcome("local", "cache").unwrap();
    assert_eq!(cache.status, OutcomeStatus::Failed);
    assert!(cache.detail.as_deref().unwrap().contains("panicked"));
    assert_eq!(status(&report, "local", "app"), OutcomeStatus::SkippedDependencyFailed);
    assert_eq!(backend.teardown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_kinds() {
    let graph = StageGraph::build([
        test_stage("db"),
        StageSpec::new("chart", BackendKind::ClusterWorkload).with_dependency("db"),
        test_stage("smoke").with_dependency("chart"),
    ])
    .unwrap();
    let backend = Arc::new(ScriptedBackend::new("local").with_capabilities(Capabilities::only(BackendKind::Process)));

    let (report, _) = run_one(graph, &backend, settings()).await;

    assert_eq!(status(&report, "local", "db"), OutcomeStatus::Ready);
    assert_eq!(status(&report, "local", "chart"), OutcomeStatus::SkippedUnsupported);
    assert_eq!(status(&report, "local", "smoke"), OutcomeStatus::SkippedDependencyFailed);
    assert_eq!(backend.execute_count("chart"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trust_action_skips_polling() {
    let graph = StageGraph::build([test_stage("db")
        .with_readiness(ReadinessCheck::default().trusting_action())])
    .unwrap();
    let backend = Arc::new(ScriptedBackend::new("local").never_ready("db"));

    let (report, _) = run_one(graph, &backend, settings().with_precheck(false)).await;

    let db = report.outcome("local", "db").unwrap();
    assert_eq!(db.status, OutcomeStatus::Ready);
    assert_eq!(db.polls, 0);
    assert_eq!(backend.probe_count("db"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failure_is_reported() {
    let backend = Arc::new(ScriptedBackend::new("local").with_teardown_error("cluster delete failed"));

    let (report, _) = run_one(scenario_graph(), &backend, settings()).await;

    assert_eq!(report.exit_code(), 0);
    let errors = &report.backends[0].teardown_errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("teardown:local"));
    assert!(errors[0].contains("cluster delete failed"));
}

fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<bool>)> {
    (1usize..8).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec((0..n, 0..n), 0..16),
            prop::collection::vec(prop::bool::weighted(0.2), n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_stages_start_only_after_dependencies_ready((n, raw_edges, failing) in dag_strategy()) {
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .filter(|(a, b)| a < b)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let graph = graph_from_edges(n, &edges).unwrap();

        let mut backend = ScriptedBackend::new("local");
        for (i, fails) in failing.iter().enumerate() {
            if *fails {
                backend = backend.with_failing_action(&format!("s{i}"), "scripted failure");
            }
        }
        let backend = Arc::new(backend);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let (report, sink) = runtime.block_on(run_one(graph, &backend, settings()));
        let timeline = sink.stage_timeline("local");

        for (i, fails) in failing.iter().enumerate() {
            let stage = format!("s{i}");
            let deps: Vec<String> = edges
                .iter()
                .filter(|(_, b)| *b == i)
                .map(|(a, _)| format!("s{a}"))
                .collect();
            let outcome = report.outcome("local", &stage).unwrap();
            prop_assert!(outcome.is_terminal());

            match position(&timeline, names::STAGE_RUNNING, &stage) {
                Some(started) => {
                    for dep in &deps {
                        let ready = position(&timeline, names::STAGE_READY, dep);
                        prop_assert!(ready.is_some_and(|r| r < started), "{stage} started before {dep} was ready");
                    }
                    let expected = if *fails { OutcomeStatus::Failed } else { OutcomeStatus::Ready };
                    prop_assert_eq!(outcome.status, expected);
                }
                None => {
                    prop_assert_eq!(outcome.status, OutcomeStatus::SkippedDependencyFailed);
                    prop_assert!(deps.iter().any(|d| status(&report, "local", d) != OutcomeStatus::Ready));
                }
            }
        }
    }
}
