//! Probe targets that work the same on every backend.

use super::command::{ToolCommand, ToolError};
use crate::core::{ProbeResult, SignalState};
use crate::errors::BackendError;
use crate::graph::ProbeTarget;
use regex::Regex;
use std::time::Duration;
use tokio::net::TcpStream;

/// Bound for a single generic probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a non-native probe target once.
///
/// Returns a `ProbeError` for [`ProbeTarget::Native`]; adapters handle that
/// variant themselves.
pub async fn probe_target(stage: &str, target: &ProbeTarget) -> ProbeResult {
    match target {
        ProbeTarget::Native => Err(BackendError::probe(
            stage,
            "native probe is not supported by this backend",
        )),
        ProbeTarget::Command {
            argv,
            expect_stdout,
        } => probe_command(stage, argv, expect_stdout.as_deref()).await,
        ProbeTarget::Tcp { host, port } => Ok(probe_tcp(host, *port).await),
        ProbeTarget::Http { url, expect_status } => probe_http(stage, url, *expect_status).await,
    }
}

async fn probe_command(stage: &str, argv: &[String], expect_stdout: Option<&str>) -> ProbeResult {
    let Some(cmd) = ToolCommand::from_argv(argv) else {
        return Err(BackendError::probe(stage, "probe command is empty"));
    };
    let pattern = expect_stdout
        .map(Regex::new)
        .transpose()
        .map_err(|e| BackendError::probe(stage, format!("invalid expect_stdout: {e}")))?;

    let output = match cmd.timeout(PROBE_TIMEOUT).output().await {
        Ok(output) => output,
        Err(ToolError::TimedOut { .. }) => {
            return Ok(SignalState::pending("probe command timed out"))
        }
        Err(e) => return Err(BackendError::probe(stage, e.to_string())),
    };

    if !output.success() {
        return Ok(SignalState::pending(output.failure_detail()));
    }
    match pattern {
        Some(re) if !re.is_match(&output.stdout) => Ok(SignalState::pending(format!(
            "stdout does not match /{}/",
            re.as_str()
        ))),
        _ => Ok(SignalState::Ready),
    }
}

async fn probe_tcp(host: &str, port: u16) -> SignalState {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => SignalState::Ready,
        Ok(Err(e)) => SignalState::pending(format!("{host}:{port}: {e}")),
        Err(_) => SignalState::pending(format!("{host}:{port}: connect timed out")),
    }
}

#[cfg(feature = "http-probe")]
async fn probe_http(stage: &str, url: &str, expect_status: u16) -> ProbeResult {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| BackendError::probe(stage, e.to_string()))?;

    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == expect_status {
                Ok(SignalState::Ready)
            } else if response.status().is_server_error() {
                Ok(SignalState::unhealthy(format!("{url} returned {status}")))
            } else {
                Ok(SignalState::pending(format!(
                    "{url} returned {status}, expected {expect_status}"
                )))
            }
        }
        Err(e) if e.is_connect() || e.is_timeout() => {
            Ok(SignalState::pending(format!("{url}: {e}")))
        }
        Err(e) => Err(BackendError::probe(stage, format!("{url}: {e}"))),
    }
}

#[cfg(not(feature = "http-probe"))]
async fn probe_http(stage: &str, url: &str, _expect_status: u16) -> ProbeResult {
    Err(BackendError::probe(
        stage,
        format!("cannot probe {url}: built without the `http-probe` feature"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn command(argv: &[&str], expect: Option<&str>) -> ProbeTarget {
        ProbeTarget::Command {
            argv: argv.iter().map(ToString::to_string).collect(),
            expect_stdout: expect.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_native_is_rejected() {
        let err = probe_target("db", &ProbeTarget::Native).await.unwrap_err();
        assert!(matches!(err, BackendError::ProbeError { .. }));
    }

    #[tokio::test]
    async fn test_command_probe() {
        let ready = probe_target("db", &command(&["sh", "-c", "echo accepting"], Some("accept")))
            .await
            .unwrap();
        assert_eq!(ready, SignalState::Ready);

        let mismatch = probe_target("db", &command(&["sh", "-c", "echo starting"], Some("^ok$")))
            .await
            .unwrap();
        assert!(matches!(mismatch, SignalState::Pending(_)));

        let failing = probe_target("db", &command(&["sh", "-c", "exit 2"], None))
            .await
            .unwrap();
        assert_eq!(failing, SignalState::pending("exit code 2"));
    }

    #[tokio::test]
    async fn test_command_probe_errors() {
        assert!(probe_target("db", &command(&[], None)).await.is_err());
        assert!(probe_target("db", &command(&["true"], Some("(")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ProbeTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert_eq!(probe_target("db", &target).await.unwrap(), SignalState::Ready);

        drop(listener);
        let signal = probe_target("db", &target).await.unwrap();
        assert!(matches!(signal, SignalState::Pending(_)));
    }
}
