//! Code-generation agent invocation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::tool::{ToolError, ToolOutput, ToolRequest, ToolRunner};

/// Common install locations probed when no explicit override is set.
const COMMON_AGENT_PATHS: &[&str] = &[
    "/home/ubuntu/.local/bin/claude",
    "/usr/local/bin/claude",
    "/home/ubuntu/.nvm/versions/node/v22.16.0/bin/claude",
    "/usr/bin/claude",
];

/// Resolve the agent binary: explicit override, then common install
/// paths, then the bare name via PATH.
pub fn find_agent_path(override_path: Option<&str>) -> String {
    if let Some(path) = override_path {
        if !path.is_empty() {
            return path.to_string();
        }
    }

    for path in COMMON_AGENT_PATHS {
        if Path::new(path).exists() {
            return path.to_string();
        }
    }

    "claude".to_string()
}

pub struct AgentRunner {
    runner: Arc<dyn ToolRunner>,
    binary: String,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        override_path: Option<&str>,
        timeout: Duration,
    ) -> Self {
        let binary = find_agent_path(override_path);
        info!("Using agent binary: {}", binary);
        Self {
            runner,
            binary,
            timeout,
        }
    }

    /// Run the agent against the workspace with the generation prompt.
    ///
    /// Returns the captured output whether or not the agent succeeded; the
    /// caller writes the transcript to the build log before acting on the
    /// exit status. Only a time-bound expiry or a spawn failure is an `Err`.
    pub async fn generate(&self, workspace: &Path, prompt: &str) -> Result<ToolOutput> {
        let request = ToolRequest::new(&self.binary, workspace, self.timeout)
            .args(["-p", "--dangerously-skip-permissions"])
            .arg(prompt)
            .env("AGENT_BINARY_PATH", &self.binary);
        self.run(request).await
    }

    /// Ask the agent to fix prebuild errors in place, continuing its
    /// previous session in the workspace.
    pub async fn repair(&self, workspace: &Path, prompt: &str) -> Result<ToolOutput> {
        let request = ToolRequest::new(&self.binary, workspace, self.timeout)
            .args(["-c", "-p", "--dangerously-skip-permissions"])
            .arg(prompt)
            .env("AGENT_BINARY_PATH", &self.binary);
        self.run(request).await
    }

    async fn run(&self, request: ToolRequest) -> Result<ToolOutput> {
        match self.runner.run(request).await {
            Ok(output) => Ok(output),
            Err(ToolError::TimedOut { timeout, .. }) => Err(OrchestratorError::Agent(format!(
                "agent timed out after {:?}",
                timeout
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
