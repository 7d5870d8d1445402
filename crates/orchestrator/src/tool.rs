//! External-tool execution capability.
//!
//! The agent, the prebuild tool, and the deploy CLI all reduce to "run a
//! program in a directory with a time bound and capture its output". That
//! capability sits behind a trait so the build pipeline can be exercised
//! with scripted outcomes instead of real subprocesses.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Deterministic PATH for tool invocations. Workspaces run user-shaped
/// toolchains, so the usual install locations are listed explicitly.
pub const TOOL_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ToolRequest {
    pub fn new(program: &str, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: vec![("PATH".to_string(), TOOL_PATH.to_string())],
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined with a labeled separator, for build logs
    /// and repair prompts.
    pub fn combined(&self, stderr_label: &str) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n--- {} ---\n{}", self.stdout, stderr_label, self.stderr)
        }
    }

    /// The most useful short failure description: stderr if present,
    /// stdout otherwise.
    pub fn failure_message(&self) -> String {
        let message = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if message.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            message.to_string()
        }
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as real subprocesses.
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ToolError> {
        debug!(
            "Running tool: {} {} (cwd: {:?}, timeout: {:?})",
            request.program,
            request.args.join(" "),
            request.cwd,
            request.timeout
        );

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the time bound fires and the future is dropped, the child
            // goes with it.
            .kill_on_drop(true);
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let output = match tokio::time::timeout(request.timeout, command.output()).await {
            Ok(result) => result.map_err(|source| ToolError::Io {
                program: request.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ToolError::TimedOut {
                    program: request.program,
                    timeout: request.timeout,
                });
            }
        };

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
