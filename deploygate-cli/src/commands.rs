use crate::cli::{BackendsArgs, CheckArgs, ListFormat, PlanArgs, RunArgs};
use anyhow::{Context, Result};
use deploygate::backends::BackendRegistry;
use deploygate::cancellation::CancellationToken;
use deploygate::config::DeploymentConfig;
use deploygate::core::Capabilities;
use deploygate::events::LoggingEventSink;
use deploygate::graph::RunPlan;
use deploygate::orchestrator::Orchestrator;
use deploygate::report::{render, ReportFormat};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const AVAILABILITY_PROBE: Duration = Duration::from_secs(15);

/// Deploys the configured graph and returns the report's exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let config = DeploymentConfig::load(&args.config)?;
    let graph = Arc::new(config.build_graph()?);
    let backends = config.registry().resolve_all(&args.backends)?;

    let mut settings = config.settings.clone();
    if let Some(secs) = args.timeout {
        settings.deadline_secs = (secs > 0).then_some(secs);
    }
    if let Some(concurrency) = args.concurrency {
        settings = settings.with_concurrency(concurrency);
    }
    if args.no_precheck {
        settings = settings.with_precheck(false);
    }

    let token = CancellationToken::new();
    let interrupt = token.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            interrupt.cancel("interrupted");
        }
    });

    info!(
        config = %args.config.display(),
        backends = ?args.backends,
        stages = graph.len(),
        "starting deployment"
    );
    let report = Orchestrator::new(settings)
        .with_event_sink(Arc::new(LoggingEventSink::default()))
        .run_with_token(graph, backends, token)
        .await;
    ctrl_c.abort();

    println!("{}", render(&report, args.format.into())?.trim_end());

    if let Some(path) = &args.report_file {
        let json = render(&report, ReportFormat::Json)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    Ok(report.exit_code())
}

/// Prints each backend's run plan without deploying anything.
pub fn plan(args: &PlanArgs) -> Result<i32> {
    let config = DeploymentConfig::load(&args.config)?;
    let graph = config.build_graph()?;
    let backends = config.registry().resolve_all(&args.backends)?;

    let plans: Vec<RunPlan> = backends
        .iter()
        .map(|b| graph.plan_for(b.name(), b.capabilities()))
        .collect();

    match args.format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
        ListFormat::Text => {
            for plan in &plans {
                print!("{}", plan_text(plan));
            }
        }
    }
    Ok(0)
}

fn plan_text(plan: &RunPlan) -> String {
    let mut out = format!("Backend {} ({} stages):\n", plan.backend, plan.len());
    for (step, entry) in plan.steps.iter().enumerate() {
        out.push_str(&format!("  {}. {} [{}] {}", step + 1, entry.name, entry.kind, entry.action));
        if !entry.depends_on.is_empty() {
            out.push_str(&format!(" (after {})", entry.depends_on.join(", ")));
        }
        out.push('\n');
    }
    for entry in &plan.unsupported {
        out.push_str(&format!("  unsupported: {} [{}]\n", entry.name, entry.kind));
    }
    out
}

/// Validates a configuration file: parse, stage graph, backend entries.
pub fn check(args: &CheckArgs) -> Result<i32> {
    let config = DeploymentConfig::load(&args.config)?;
    let graph = config.build_graph()?;
    let registry = config.registry();
    for name in config.backends.keys() {
        registry.resolve(name)?;
    }

    let order: Vec<&str> = graph.topo_order().map(|s| s.name.as_str()).collect();
    println!(
        "{}: ok, {} stages, {} configured backends",
        args.config.display(),
        graph.len(),
        config.backends.len()
    );
    println!("order: {}", order.join(" -> "));
    Ok(0)
}

#[derive(Debug, Serialize)]
struct BackendStatus {
    name: String,
    #[serde(rename = "type")]
    type_name: &'static str,
    available: bool,
    capabilities: Capabilities,
}

/// Lists every known backend and whether its tooling is reachable.
pub async fn backends(args: &BackendsArgs) -> Result<i32> {
    let registry = match &args.config {
        Some(path) => DeploymentConfig::load(path)?.registry(),
        None => BackendRegistry::new(),
    };

    let checks = registry.names().into_iter().map(|name| {
        let registry = &registry;
        async move {
            let backend = registry.resolve(&name)?;
            let available = tokio::time::timeout(AVAILABILITY_PROBE, backend.is_available())
                .await
                .unwrap_or(false);
            let type_name = registry.config_for(&name).map_or("unknown", |c| c.type_name());
            Ok::<_, anyhow::Error>(BackendStatus {
                name,
                type_name,
                available,
                capabilities: backend.capabilities(),
            })
        }
    });
    let statuses = join_all(checks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    match args.format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
        ListFormat::Text => {
            println!("{:<16} {:<12} {:<10} CAPABILITIES", "NAME", "TYPE", "AVAILABLE");
            for status in &statuses {
                println!(
                    "{:<16} {:<12} {:<10} {}",
                    status.name,
                    status.type_name,
                    if status.available { "yes" } else { "no" },
                    status.capabilities
                );
            }
        }
    }
    Ok(0)
}
