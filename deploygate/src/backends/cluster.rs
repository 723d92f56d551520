//! Cluster backend over `kubectl`, with optional ephemeral kind clusters.

use super::{
    probe_target, run_command_action, run_tool, unsupported_action, Backend, ToolCommand,
};
use crate::core::{ActionReport, ActionResult, BackendKind, Capabilities, ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::{DeployAction, ProbeTarget, StageSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(30);
const KIND_CREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Settings for a persistent cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// kubectl context; `None` uses the kubeconfig's current context.
    #[serde(default)]
    pub context: Option<String>,
    /// Namespace for applies and probes.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Explicit kubeconfig path.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// The kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

/// Settings for an ephemeral kind cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindConfig {
    /// Cluster name.
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Keep the cluster after the run.
    #[serde(default)]
    pub keep: bool,
    /// Node image override.
    #[serde(default)]
    pub node_image: Option<String>,
    /// Namespace for applies and probes.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// The kind binary.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// The kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_kind() -> String {
    "kind".to_string()
}

fn default_cluster() -> String {
    "deploygate".to_string()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            context: None,
            namespace: default_namespace(),
            kubeconfig: None,
            kubectl: default_kubectl(),
        }
    }
}

impl Default for KindConfig {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            keep: false,
            node_image: None,
            namespace: default_namespace(),
            kind: default_kind(),
            kubectl: default_kubectl(),
        }
    }
}

#[derive(Debug)]
enum Lifecycle {
    Persistent,
    Ephemeral(KindConfig),
}

/// Applies manifests to a cluster and watches workload readiness.
#[derive(Debug)]
pub struct ClusterBackend {
    name: String,
    lifecycle: Lifecycle,
    context: Option<String>,
    namespace: String,
    kubeconfig: Option<PathBuf>,
    kubectl: String,
    created_cluster: AtomicBool,
}

impl ClusterBackend {
    /// Creates a backend for an existing cluster.
    #[must_use]
    pub fn persistent(name: impl Into<String>, config: KubernetesConfig) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Persistent,
            context: config.context,
            namespace: config.namespace,
            kubeconfig: config.kubeconfig,
            kubectl: config.kubectl,
            created_cluster: AtomicBool::new(false),
        }
    }

    /// Creates a backend that owns a kind cluster.
    #[must_use]
    pub fn ephemeral(name: impl Into<String>, config: KindConfig) -> Self {
        Self {
            name: name.into(),
            context: Some(format!("kind-{}", config.cluster)),
            namespace: config.namespace.clone(),
            kubeconfig: None,
            kubectl: config.kubectl.clone(),
            lifecycle: Lifecycle::Ephemeral(config),
            created_cluster: AtomicBool::new(false),
        }
    }

    /// `kubectl [--kubeconfig K] [--context C] --namespace N`
    fn kubectl(&self) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.kubectl.clone()).timeout(KUBECTL_TIMEOUT);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd = cmd.arg("--kubeconfig").arg(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            cmd = cmd.args(["--context", context.as_str()]);
        }
        cmd.args(["--namespace", self.namespace.as_str()])
    }

    fn apply_command(&self, paths: &[PathBuf]) -> ToolCommand {
        let mut cmd = self.kubectl().arg("apply");
        for path in paths {
            cmd = cmd.arg("-f").arg(path.display().to_string());
        }
        cmd
    }

    async fn cluster_exists(&self, kind: &KindConfig) -> Result<bool, BackendError> {
        let output = ToolCommand::new(kind.kind.clone())
            .args(["get", "clusters"])
            .timeout(KUBECTL_TIMEOUT)
            .output()
            .await
            .map_err(|e| BackendError::unavailable(&self.name, e.to_string()))?;
        if !output.success() {
            return Err(BackendError::unavailable(&self.name, output.failure_detail()));
        }
        Ok(output.stdout.lines().any(|l| l.trim() == kind.cluster))
    }

    async fn native_signal(&self, stage: &StageSpec) -> ProbeResult {
        let DeployAction::Manifest {
            workload: Some(workload),
            ..
        } = stage.action_for(&self.name)
        else {
            return Err(BackendError::probe(
                &stage.name,
                "native probe needs a manifest action with a workload",
            ));
        };
        let output = self
            .kubectl()
            .args(["get", workload.as_str(), "-o", "json"])
            .output()
            .await
            .map_err(|e| BackendError::probe(&stage.name, e.to_string()))?;
        if !output.success() {
            if output.stderr.contains("NotFound") {
                return Ok(SignalState::pending(format!("{workload} not found")));
            }
            return Err(BackendError::probe(&stage.name, output.failure_detail()));
        }
        parse_workload_status(&output.stdout).map_err(|e| BackendError::probe(&stage.name, e))
    }
}

/// Maps `kubectl get <workload> -o json` output to a signal.
///
/// Replica-based workloads are ready once `readyReplicas` reaches
/// `spec.replicas`; pods once their `Ready` condition is true; jobs once they
/// succeeded.
///
/// # Errors
///
/// Returns an error if the output is not a Kubernetes object.
pub fn parse_workload_status(raw: &str) -> Result<SignalState, String> {
    let object: Value =
        serde_json::from_str(raw.trim()).map_err(|e| format!("unparseable workload: {e}"))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| "object has no kind".to_string())?;
    let status = object.get("status").cloned().unwrap_or(Value::Null);
    let count = |v: &Value, key: &str| v.get(key).and_then(Value::as_i64).unwrap_or(0);

    match kind {
        "Pod" => {
            let phase = status.get("phase").and_then(Value::as_str).unwrap_or("Unknown");
            let ready = status
                .get("conditions")
                .and_then(Value::as_array)
                .is_some_and(|conds| {
                    conds.iter().any(|c| {
                        c.get("type").and_then(Value::as_str) == Some("Ready")
                            && c.get("status").and_then(Value::as_str) == Some("True")
                    })
                });
            Ok(match phase {
                "Running" if ready => SignalState::Ready,
                "Succeeded" => SignalState::Ready,
                "Failed" => SignalState::unhealthy("pod failed"),
                other => SignalState::pending(format!("pod {other}")),
            })
        }
        "Job" => {
            if count(&status, "succeeded") > 0 {
                Ok(SignalState::Ready)
            } else if count(&status, "failed") > 0 {
                Ok(SignalState::unhealthy(format!(
                    "job failed {} time(s)",
                    count(&status, "failed")
                )))
            } else {
                Ok(SignalState::pending("job running"))
            }
        }
        "DaemonSet" => {
            let desired = count(&status, "desiredNumberScheduled");
            let ready = count(&status, "numberReady");
            Ok(replica_signal(ready, desired))
        }
        _ => {
            let desired = object
                .get("spec")
                .and_then(|s| s.get("replicas"))
                .and_then(Value::as_i64)
                .unwrap_or(1);
            Ok(replica_signal(count(&status, "readyReplicas"), desired))
        }
    }
}

fn replica_signal(ready: i64, desired: i64) -> SignalState {
    if ready >= desired {
        SignalState::Ready
    } else {
        SignalState::pending(format!("{ready}/{desired} replicas ready"))
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::only(BackendKind::ClusterWorkload)
    }

    async fn is_available(&self) -> bool {
        match &self.lifecycle {
            Lifecycle::Persistent => {
                self.kubectl()
                    .args(["version", "--request-timeout=10s"])
                    .succeeds()
                    .await
            }
            Lifecycle::Ephemeral(kind) => {
                ToolCommand::new(kind.kind.clone())
                    .arg("version")
                    .timeout(KUBECTL_TIMEOUT)
                    .succeeds()
                    .await
            }
        }
    }

    async fn prepare(&self) -> Result<(), BackendError> {
        let Lifecycle::Ephemeral(kind) = &self.lifecycle else {
            return Ok(());
        };
        if self.cluster_exists(kind).await? {
            info!(backend = %self.name, cluster = %kind.cluster, "reusing existing kind cluster");
            return Ok(());
        }

        let mut create = ToolCommand::new(kind.kind.clone())
            .args(["create", "cluster", "--name", kind.cluster.as_str(), "--wait", "120s"])
            .timeout(KIND_CREATE_TIMEOUT);
        if let Some(image) = &kind.node_image {
            create = create.args(["--image", image.as_str()]);
        }
        // Owned before `create` runs: an interrupted or failed create can
        // leave a partial cluster behind.
        self.created_cluster.store(true, Ordering::SeqCst);
        info!(backend = %self.name, cluster = %kind.cluster, "creating kind cluster");
        let detail = match create.output().await {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => format!("kind create cluster failed: {}", output.failure_detail()),
            Err(e) => e.to_string(),
        };
        if let Err(e) = self.teardown().await {
            warn!(backend = %self.name, cluster = %kind.cluster, error = %e, "removing partial kind cluster failed");
        }
        Err(BackendError::unavailable(&self.name, detail))
    }

    async fn execute(&self, stage: &StageSpec) -> ActionResult {
        let action = stage.action_for(&self.name);
        match action {
            DeployAction::Manifest { paths, .. } => {
                if paths.is_empty() {
                    return Err(BackendError::action_failed(&stage.name, "no manifest paths"));
                }
                run_tool(&stage.name, &self.apply_command(paths)).await
            }
            DeployAction::Command { .. } => run_command_action(&stage.name, action).await,
            DeployAction::External => Ok(ActionReport::empty()),
            other => Err(unsupported_action(&stage.name, &self.name, other)),
        }
    }

    async fn probe(&self, stage: &StageSpec) -> ProbeResult {
        match &stage.readiness.probe {
            ProbeTarget::Native => self.native_signal(stage).await,
            target => probe_target(&stage.name, target).await,
        }
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let Lifecycle::Ephemeral(kind) = &self.lifecycle else {
            return Ok(());
        };
        if kind.keep || !self.created_cluster.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let cmd = ToolCommand::new(kind.kind.clone())
            .args(["delete", "cluster", "--name", kind.cluster.as_str()])
            .timeout(KIND_CREATE_TIMEOUT);
        run_tool("teardown", &cmd).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    #[cfg(unix)]
    use crate::backends::fake_tool;

    #[cfg(unix)]
    fn kind_backend(dir: &std::path::Path, body: &str) -> ClusterBackend {
        let kind = fake_tool::install(dir, "kind", body);
        ClusterBackend::ephemeral(
            "kind",
            KindConfig {
                kind: kind.display().to_string(),
                ..KindConfig::default()
            },
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_create_still_deletes_cluster() {
        use crate::cancellation::CancellationToken;
        use crate::core::OutcomeStatus;
        use crate::graph::StageGraph;
        use crate::orchestrator::{Orchestrator, RunSettings};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let backend = kind_backend(
            dir.path(),
            r#"case "$1" in get) echo other ;; create) exec sleep 30 ;; esac"#,
        );
        let graph = StageGraph::build([StageSpec::new("app", BackendKind::ClusterWorkload)]).unwrap();

        let token = CancellationToken::new();
        let _timer = token.cancel_after(Duration::from_millis(500), "interrupted");
        let report = Orchestrator::new(RunSettings::default().with_deadline(None))
            .run_with_token(Arc::new(graph), vec![Arc::new(backend) as Arc<dyn Backend>], token)
            .await;

        let app = report.outcome("kind", "app").unwrap();
        assert!(app.is_terminal());
        assert_ne!(app.status, OutcomeStatus::Ready);
        assert!(report.backends[0].teardown_errors.is_empty());

        let calls = fake_tool::calls(dir.path());
        assert!(calls.iter().any(|c| c.starts_with("create cluster --name deploygate")));
        assert_eq!(calls.last().map(String::as_str), Some("delete cluster --name deploygate"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_create_removes_partial_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let backend = kind_backend(
            dir.path(),
            r#"case "$1" in create) echo "node failed to start" >&2; exit 1 ;; esac"#,
        );

        let err = backend.prepare().await.unwrap_err();
        assert!(err.detail().contains("node failed to start"));
        backend.teardown().await.unwrap();

        let deletes = fake_tool::calls(dir.path())
            .into_iter()
            .filter(|c| c.starts_with("delete cluster"))
            .count();
        assert_eq!(deletes, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reused_cluster_is_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = kind_backend(dir.path(), r#"if [ "$1" = get ]; then echo deploygate; fi"#);

        backend.prepare().await.unwrap();
        backend.teardown().await.unwrap();

        assert_eq!(fake_tool::calls(dir.path()), vec!["get clusters"]);
    }

    #[test]
    fn test_parse_deployment_replicas() {
        let raw = r#"{"kind":"Deployment","spec":{"replicas":3},"status":{"readyReplicas":1}}"#;
        assert_eq!(
            parse_workload_status(raw).unwrap(),
            SignalState::pending("1/3 replicas ready")
        );
        let ready = r#"{"kind":"StatefulSet","spec":{"replicas":2},"status":{"readyReplicas":2}}"#;
        assert_eq!(parse_workload_status(ready).unwrap(), SignalState::Ready);
    }

    #[test]
    fn test_parse_fresh_deployment_without_status() {
        let raw = r#"{"kind":"Deployment","spec":{"replicas":1},"status":{}}"#;
        assert_eq!(
            parse_workload_status(raw).unwrap(),
            SignalState::pending("0/1 replicas ready")
        );
    }

    #[test]
    fn test_parse_pod_phases() {
        let running = r#"{"kind":"Pod","status":{"phase":"Running","conditions":[{"type":"Ready","status":"True"}]}}"#;
        assert_eq!(parse_workload_status(running).unwrap(), SignalState::Ready);

        let not_ready = r#"{"kind":"Pod","status":{"phase":"Running","conditions":[{"type":"Ready","status":"False"}]}}"#;
        assert_eq!(
            parse_workload_status(not_ready).unwrap(),
            SignalState::pending("pod Running")
        );

        let failed = r#"{"kind":"Pod","status":{"phase":"Failed"}}"#;
        assert!(matches!(
            parse_workload_status(failed).unwrap(),
            SignalState::Unhealthy(_)
        ));
    }

    #[test]
    fn test_parse_job_and_daemonset() {
        let job = r#"{"kind":"Job","status":{"succeeded":1}}"#;
        assert_eq!(parse_workload_status(job).unwrap(), SignalState::Ready);
        let ds = r#"{"kind":"DaemonSet","status":{"desiredNumberScheduled":3,"numberReady":2}}"#;
        assert_eq!(
            parse_workload_status(ds).unwrap(),
            SignalState::pending("2/3 replicas ready")
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_workload_status("error: the server doesn't have a resource type").is_err());
        assert!(parse_workload_status("{}").is_err());
    }

    #[test]
    fn test_kubectl_arguments_are_explicit() {
        let backend = ClusterBackend::persistent(
            "staging",
            KubernetesConfig {
                context: Some("staging".to_string()),
                namespace: "verify".to_string(),
                kubeconfig: Some(PathBuf::from("/tmp/kubeconfig")),
                ..KubernetesConfig::default()
            },
        );
        let cmd = backend.apply_command(&[PathBuf::from("k8s/db.yaml"), PathBuf::from("k8s/api.yaml")]);
        assert_eq!(
            cmd.to_string(),
            "kubectl --kubeconfig /tmp/kubeconfig --context staging --namespace verify \
             apply -f k8s/db.yaml -f k8s/api.yaml"
        );
    }

    #[test]
    fn test_kind_uses_kind_context() {
        let backend = ClusterBackend::ephemeral("kind", KindConfig::default());
        assert_eq!(
            backend.kubectl().to_string(),
            "kubectl --context kind-deploygate --namespace default"
        );
    }

    #[tokio::test]
    async fn test_kind_prepare_fails_without_tooling() {
        let backend = ClusterBackend::ephemeral(
            "kind",
            KindConfig {
                kind: "deploygate-missing-kind".to_string(),
                ..KindConfig::default()
            },
        );
        assert!(!backend.is_available().await);
        let err = backend.prepare().await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
        assert!(backend.teardown().await.is_ok());
    }
}
