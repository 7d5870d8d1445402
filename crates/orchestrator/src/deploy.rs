//! Hosting-provider client: project link, prebuilt deploy, and
//! protection relaxation.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::tool::{ToolError, ToolRequest, ToolRunner};

const PROVIDER_API_BASE: &str = "https://api.vercel.com";
const PROVIDER_HOST_SUBSTRING: &str = "vercel.app";

pub struct DeployClient {
    runner: Arc<dyn ToolRunner>,
    http: reqwest::Client,
    api_token: Option<String>,
    link_timeout: Duration,
    deploy_timeout: Duration,
}

impl DeployClient {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        api_token: Option<String>,
        link_timeout: Duration,
        deploy_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            http: reqwest::Client::new(),
            api_token,
            link_timeout,
            deploy_timeout,
        }
    }

    /// Bind the workspace to a hosting-provider project (creating one if
    /// absent), writing the project descriptor into the workspace.
    pub async fn link(&self, workspace: &Path) -> Result<()> {
        let request =
            ToolRequest::new("vercel", workspace, self.link_timeout).args(["link", "--yes"]);

        let output = match self.runner.run(request).await {
            Ok(output) => output,
            Err(ToolError::TimedOut { timeout, .. }) => {
                return Err(OrchestratorError::Deploy(format!(
                    "project link timed out after {:?}",
                    timeout
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !output.success() {
            return Err(OrchestratorError::Deploy(format!(
                "project link failed: {}",
                output.failure_message()
            )));
        }

        info!("Linked workspace to hosting-provider project");
        Ok(())
    }

    /// Submit a prebuilt deployment of the workspace and return its URL.
    pub async fn deploy(&self, workspace: &Path) -> Result<String> {
        let request = ToolRequest::new("vercel", workspace, self.deploy_timeout).args([
            "deploy",
            "--yes",
            "--prebuilt",
            "--target=preview",
        ]);

        let output = match self.runner.run(request).await {
            Ok(output) => output,
            Err(ToolError::TimedOut { timeout, .. }) => {
                return Err(OrchestratorError::Deploy(format!(
                    "deployment timed out after {:?}",
                    timeout
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !output.success() {
            return Err(OrchestratorError::Deploy(output.failure_message()));
        }

        let url = match parse_deployment_url(&output.stdout) {
            Some(url) => url,
            None => {
                let fallback = fallback_deployment_url(workspace);
                warn!(
                    "Could not parse deployment URL from output, using fallback: {}",
                    fallback
                );
                fallback
            }
        };

        info!("Deployment successful: {}", url);
        Ok(url)
    }

    /// Null both SSO and password protection on the project so the
    /// deployment is publicly reachable. Requires an API token.
    pub async fn relax_protection(&self, project_id: &str) -> Result<()> {
        let token = self.api_token.as_ref().ok_or_else(|| {
            OrchestratorError::Deploy("no provider API token configured".to_string())
        })?;

        let url = format!("{}/v9/projects/{}", PROVIDER_API_BASE, project_id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(&json!({
                "ssoProtection": null,
                "passwordProtection": null,
            }))
            .send()
            .await
            .map_err(|e| OrchestratorError::Deploy(format!("protection update failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Deploy(format!(
                "protection update failed: {} {}",
                status, body
            )));
        }

        info!("✅ Deployment protection disabled for project {}", project_id);
        Ok(())
    }
}

/// Scan deploy output for the first token that looks like a deployment
/// URL on the provider's host.
fn parse_deployment_url(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.contains("https://") || !line.contains(PROVIDER_HOST_SUBSTRING) {
            continue;
        }
        for token in line.split_whitespace() {
            if token.starts_with("https://") && token.contains(PROVIDER_HOST_SUBSTRING) {
                return Some(token.trim().to_string());
            }
        }
    }
    None
}

/// URL synthesized from the workspace folder name when parsing fails.
fn fallback_deployment_url(workspace: &Path) -> String {
    let folder = workspace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deployment".to_string());
    format!("https://{}.{}", folder, PROVIDER_HOST_SUBSTRING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_from_noisy_output() {
        let stdout = "Vercel CLI 39.1.1\n\
                      Inspect: https://vercel.com/acme/demo/4Xyz123 [2s]\n\
                      Production: https://demo-abc123.vercel.app [2s]\n";
        assert_eq!(
            parse_deployment_url(stdout).unwrap(),
            "https://demo-abc123.vercel.app"
        );
    }

    #[test]
    fn test_parse_url_ignores_non_provider_hosts() {
        let stdout = "see https://example.com/docs for details\n";
        assert!(parse_deployment_url(stdout).is_none());
    }

    #[test]
    fn test_fallback_url_uses_folder_name() {
        assert_eq!(
            fallback_deployment_url(Path::new("/tmp/workspaces/app-42")),
            "https://app-42.vercel.app"
        );
    }
}
