//! External tool invocation shared by every adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Default bound for a foreground tool call.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 5;

/// Errors from running an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// The program.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish in time and was killed.
    #[error("`{program}` did not finish within {after:?}")]
    TimedOut {
        /// The program.
        program: String,
        /// The bound that elapsed.
        after: Duration,
    },
}

/// Captured result of a finished tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ToolOutput {
    /// Returns true on exit code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The last few non-empty stderr lines, joined.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        stderr_tail(&self.stderr, STDERR_TAIL_LINES)
    }

    /// One-line description of a failed call.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        let status = self
            .code
            .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"));
        let tail = self.stderr_tail();
        if tail.is_empty() {
            status
        } else {
            format!("{status}: {tail}")
        }
    }
}

fn stderr_tail(stderr: &str, lines: usize) -> String {
    let kept: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join(" | ")
}

/// A single external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl ToolCommand {
    /// Creates a command for a program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Creates a command from an argv list; `None` when empty.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds environment variables.
    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Sets the timeout for [`output`](Self::output).
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Runs to completion and captures output.
    ///
    /// The child is killed if the timeout elapses or the future is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started or times out. A
    /// non-zero exit is not an error; check [`ToolOutput::success`].
    pub async fn output(&self) -> Result<ToolOutput, ToolError> {
        debug!(command = %self, "running tool");
        let mut cmd = self.build();
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::TimedOut {
                program: self.program.clone(),
                after: self.timeout,
            })?
            .map_err(|e| self.spawn_error(e))?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Returns true if the command runs and exits zero within the timeout.
    pub async fn succeeds(&self) -> bool {
        self.output().await.is_ok_and(|o| o.success())
    }

    /// Spawns a long-running child with output discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started.
    pub fn spawn(&self) -> Result<Child, ToolError> {
        debug!(command = %self, "spawning tool");
        let mut cmd = self.build();
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn().map_err(|e| self.spawn_error(e))
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
