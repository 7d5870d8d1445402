//! Prebuild toolchain invocation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::tool::{ToolError, ToolRequest, ToolRunner};

pub struct PrebuildRunner {
    runner: Arc<dyn ToolRunner>,
    timeout: Duration,
}

impl PrebuildRunner {
    pub fn new(runner: Arc<dyn ToolRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Run `vercel build` in the workspace, producing the prebuilt output
    /// a later deploy submits.
    ///
    /// On failure the error message is the *combined* stdout+stderr: the
    /// repair prompt relies on the agent seeing the full build output.
    pub async fn build(&self, workspace: &Path) -> Result<()> {
        let request = ToolRequest::new("vercel", workspace, self.timeout).args([
            "build",
            "--target=preview",
            "--yes",
        ]);

        let output = match self.runner.run(request).await {
            Ok(output) => output,
            Err(ToolError::TimedOut { timeout, .. }) => {
                return Err(OrchestratorError::Prebuild(format!(
                    "prebuild timed out after {:?}",
                    timeout
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !output.success() {
            let combined = output.combined("BUILD ERRORS");
            let message = if combined.trim().is_empty() {
                format!("prebuild exited with code {}", output.exit_code)
            } else {
                combined.trim().to_string()
            };
            return Err(OrchestratorError::Prebuild(message));
        }

        info!("Prebuild succeeded");
        Ok(())
    }
}
