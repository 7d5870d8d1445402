//! The per-version build pipeline.
//!
//! One `Builder::run` call owns one version from `pending` to a terminal
//! state: claim it, seed a workspace, drive the agent, prebuild with
//! repair retries, package and upload the artifact, deploy, and converge
//! the database row, publishing progress the whole way. The run is
//! detached from the originating HTTP request, so a user navigating away
//! never orphans a half-built deployment.

use events::{EventBus, ProgressStatus};
use state::Database;
use state::entity::apps::AppStatus;
use state::entity::comments;
use std::sync::Arc;
use storage::constants::artifact_key;
use storage::{ArtifactStore, archive};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::deploy::DeployClient;
use crate::error::OrchestratorError;
use crate::prebuild::PrebuildRunner;
use crate::progress::ProgressPublisher;
use crate::prompt::{build_prompt, repair_prompt};
use crate::tool::{ToolRequest, ToolRunner};
use crate::workspace::{Workspace, WorkspaceManager};

pub struct BuildRequest {
    pub version_id: String,
    pub app_id: String,
    /// Non-empty only for the first version of an app.
    pub requirements: String,
    /// Submitted comments driving an iteration build, in input order.
    pub comments: Vec<comments::Model>,
    /// Present only on the first build; seeds the app-scoped admin
    /// identity during schema bootstrap.
    pub owner_email: Option<String>,
}

/// A phase failure: what we were doing, and what went wrong.
struct BuildFailure {
    message: String,
}

impl BuildFailure {
    fn new(context: &str, cause: impl std::fmt::Display) -> Self {
        Self {
            message: format!("{}: {}", context, cause),
        }
    }
}

type PhaseResult<T> = std::result::Result<T, BuildFailure>;

pub struct Builder {
    config: Arc<Config>,
    db: Arc<Database>,
    artifacts: Arc<ArtifactStore>,
    progress: ProgressPublisher,
    tools: Arc<dyn ToolRunner>,
    workspaces: WorkspaceManager,
    agent: AgentRunner,
    prebuild: PrebuildRunner,
    deploy: DeployClient,
}

impl Builder {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        artifacts: Arc<ArtifactStore>,
        bus: Arc<EventBus>,
        tools: Arc<dyn ToolRunner>,
    ) -> Self {
        let agent = AgentRunner::new(
            tools.clone(),
            config.agent_binary_path.as_deref(),
            config.agent_timeout,
        );
        let prebuild = PrebuildRunner::new(tools.clone(), config.prebuild_timeout);
        let deploy = DeployClient::new(
            tools.clone(),
            config.vercel_token.clone(),
            config.link_timeout,
            config.deploy_timeout,
        );
        Self {
            workspaces: WorkspaceManager::new(config.workspace_dir.clone()),
            progress: ProgressPublisher::new(bus),
            config,
            db,
            artifacts,
            tools,
            agent,
            prebuild,
            deploy,
        }
    }

    /// Execute the pipeline for one version, converging the version row to
    /// a terminal state no matter how the pipeline ends, including a panic
    /// inside a phase.
    pub async fn run(self: Arc<Self>, request: BuildRequest) {
        let version_id = request.version_id.clone();
        let app_id = request.app_id.clone();

        info!(
            "Starting build for version {} of app {}",
            version_id, app_id
        );

        let builder = self.clone();
        let outcome = tokio::spawn(async move { builder.execute(request).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                self.converge_failed(&version_id, &app_id, &failure.message).await;
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    let panic = join_error.into_panic();
                    let text = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("Internal error: build panicked: {}", text)
                } else {
                    "Internal error: build task was cancelled".to_string()
                };
                self.converge_failed(&version_id, &app_id, &message).await;
            }
        }
    }

    async fn execute(&self, request: BuildRequest) -> PhaseResult<()> {
        let version_id = &request.version_id;
        let app_id = &request.app_id;

        // Claim the version. Losing the conditional write means another
        // run already owns it (or it is terminal); leave it alone.
        match self.db.try_mark_building(version_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Version {} is not pending, skipping build (another run owns it?)",
                    version_id
                );
                return Ok(());
            }
            Err(e) => return Err(BuildFailure::new("Failed to update status to building", e)),
        }

        // Browser subscribers may attach only after the create response
        // returns; give them a moment so the first message is broadcast to
        // someone.
        sleep(self.config.subscribe_grace).await;
        self.building(version_id, "Starting build process...").await;

        let workspace = self
            .workspaces
            .create(app_id)
            .map_err(|e| BuildFailure::new("Failed to create workspace", e))?;

        self.building(version_id, "Setting up workspace...").await;
        self.seed_workspace(&workspace, app_id)
            .await
            .map_err(|e| BuildFailure::new("Failed to setup workspace", e))?;

        self.building(version_id, "Linking Vercel project...").await;
        self.deploy
            .link(workspace.path())
            .await
            .map_err(|e| BuildFailure::new("Failed to link Vercel project", e))?;

        let prompt = build_prompt(app_id, &request.requirements, &request.comments);

        self.building(version_id, "Running AI code generation...").await;
        let output = self
            .agent
            .generate(workspace.path(), &prompt)
            .await
            .map_err(|e| BuildFailure::new("AI code generation failed", e))?;
        self.append_build_log(version_id, &output.combined("STDERR")).await;
        if !output.success() {
            return Err(BuildFailure::new(
                "AI code generation failed",
                output.failure_message(),
            ));
        }

        self.prebuild_with_repair(version_id, &workspace).await?;

        if workspace.schemas_dir().is_dir() {
            self.building(version_id, "Setting up database schema...").await;
            if let Err(e) = self
                .bootstrap_schema(&workspace, app_id, request.owner_email.as_deref())
                .await
            {
                // Schema bootstrap is best-effort; the app may not need a
                // database at all.
                warn!("Failed to setup database for app {}: {}", app_id, e);
            }
        }

        self.building(version_id, "Packaging code...").await;
        let data = archive::pack_workspace(workspace.path())
            .map_err(|e| BuildFailure::new("Failed to package code", e))?;

        self.building(version_id, "Uploading artifact...").await;
        let key = artifact_key(app_id, version_id);
        self.artifacts
            .put(&key, data)
            .await
            .map_err(|e| BuildFailure::new("Failed to upload artifact", e))?;
        self.db
            .set_artifact_key(version_id, &key)
            .await
            .map_err(|e| BuildFailure::new("Failed to record artifact key", e))?;

        self.building(version_id, "Deploying to Vercel...").await;
        let url = self
            .deploy
            .deploy(workspace.path())
            .await
            .map_err(|e| BuildFailure::new("Failed to deploy to Vercel", e))?;
        // The CLI's prebuilt path does not emit a stable deployment id, so
        // the version id stands in for it.
        self.db
            .set_deploy_result(version_id, &url, version_id)
            .await
            .map_err(|e| BuildFailure::new("Failed to record deployment URL", e))?;

        match workspace.provider_project_id() {
            Ok(project_id) => {
                if let Err(e) = self.deploy.relax_protection(&project_id).await {
                    warn!("Failed to disable deployment protection: {}", e);
                }
            }
            Err(e) => {
                warn!("Could not read project id to disable protection: {}", e);
            }
        }

        self.db
            .mark_completed(version_id)
            .await
            .map_err(|e| BuildFailure::new("Failed to mark as completed", e))?;
        self.progress
            .publish(
                version_id,
                ProgressStatus::Completed,
                "Build completed successfully!",
            )
            .await;

        if let Err(e) = self.db.update_app_status(app_id, AppStatus::Active).await {
            warn!("Failed to update app status for app {}: {}", app_id, e);
        }

        info!("✅ Build completed successfully for version {}", version_id);
        Ok(())
    }

    /// Prebuild with up to `max_build_attempts` attempts, asking the agent
    /// to repair in place between failures.
    async fn prebuild_with_repair(
        &self,
        version_id: &str,
        workspace: &Workspace,
    ) -> PhaseResult<()> {
        let max_attempts = self.config.max_build_attempts;

        for attempt in 1..=max_attempts {
            if attempt == 1 {
                self.building(version_id, "Building with Vercel...").await;
            } else {
                self.building(
                    version_id,
                    &format!("Retrying build (attempt {}/{})...", attempt, max_attempts),
                )
                .await;
            }

            let build_output = match self.prebuild.build(workspace.path()).await {
                Ok(()) => {
                    info!(
                        "Prebuild successful for version {} (attempt {}/{})",
                        version_id, attempt, max_attempts
                    );
                    return Ok(());
                }
                Err(OrchestratorError::Prebuild(output)) => output,
                Err(e) => return Err(BuildFailure::new("Build failed", e)),
            };

            warn!(
                "Prebuild failed for version {} (attempt {}/{})",
                version_id, attempt, max_attempts
            );
            self.append_build_log(
                version_id,
                &format!(
                    "PREBUILD FAILED (attempt {}/{}):\n{}",
                    attempt, max_attempts, build_output
                ),
            )
            .await;

            if attempt >= max_attempts {
                return Err(BuildFailure::new(
                    &format!("Build failed after {} attempts", max_attempts),
                    build_output,
                ));
            }

            self.building(
                version_id,
                &format!(
                    "Build failed (attempt {}/{}), agent is fixing errors...",
                    attempt, max_attempts
                ),
            )
            .await;

            let prompt = repair_prompt(attempt, max_attempts, &build_output);
            let repair_output = self
                .agent
                .repair(workspace.path(), &prompt)
                .await
                .map_err(|e| BuildFailure::new("Agent failed to fix build errors", e))?;
            self.append_build_log(version_id, &repair_output.combined("STDERR")).await;
            if !repair_output.success() {
                return Err(BuildFailure::new(
                    "Agent failed to fix build errors",
                    repair_output.failure_message(),
                ));
            }
        }

        unreachable!("loop either returns success or exhausts attempts");
    }

    /// Seed the workspace: extract the latest completed artifact, else
    /// mirror the starter tree.
    async fn seed_workspace(
        &self,
        workspace: &Workspace,
        app_id: &str,
    ) -> anyhow::Result<()> {
        if let Some(prior) = self.db.latest_completed_artifact(app_id).await? {
            // latest_completed_artifact only returns rows with a key.
            let key = prior
                .artifact_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("completed version {} has no artifact", prior.id))?;
            info!(
                "Seeding workspace from artifact {} (version {})",
                key, prior.version_number
            );
            let data = self.artifacts.get(key).await?;
            archive::extract_archive(&data, workspace.path())?;
        } else {
            workspace.mirror_starter(&self.config.starter_code_dir)?;
        }
        Ok(())
    }

    /// Create the app database and collections via the external
    /// app-manager tool. Callers treat failures as warnings.
    async fn bootstrap_schema(
        &self,
        workspace: &Workspace,
        app_id: &str,
        owner_email: Option<&str>,
    ) -> anyhow::Result<()> {
        let schemas_dir = workspace.schemas_dir();
        info!(
            "Setting up database for app {} with schemas from {:?}",
            app_id, schemas_dir
        );

        let mut request = ToolRequest::new(
            "app-manager",
            workspace.path(),
            self.config.schema_bootstrap_timeout,
        )
        .args(["create", app_id, "--schemas"])
        .arg(schemas_dir.to_string_lossy());
        if let Some(email) = owner_email {
            if !email.is_empty() {
                request = request.args(["--owner-email", email]);
            }
        }

        let output = self.tools.run(request).await?;
        if !output.success() {
            anyhow::bail!("app-manager failed: {}", output.failure_message());
        }

        info!("✅ Database setup completed for app {}", app_id);
        Ok(())
    }

    /// Best-effort convergence after a phase failure or a panic: version
    /// row to `failed`, terminal event out, app status to `error`.
    async fn converge_failed(&self, version_id: &str, app_id: &str, message: &str) {
        error!("Build failed for version {}: {}", version_id, message);

        if let Err(e) = self.db.mark_failed(version_id, message).await {
            error!("Failed to update version {} with error: {}", version_id, e);
        }

        self.progress
            .publish(version_id, ProgressStatus::Failed, message)
            .await;

        if let Err(e) = self.db.update_app_status(app_id, AppStatus::Error).await {
            warn!("Failed to update app status for app {}: {}", app_id, e);
        }
    }

    async fn building(&self, version_id: &str, message: &str) {
        self.progress
            .publish(version_id, ProgressStatus::Building, message)
            .await;
    }

    /// Build-log writes are never fatal; the transcript also went to the
    /// tracing log.
    async fn append_build_log(&self, version_id: &str, transcript: &str) {
        if let Err(e) = self.db.append_build_log(version_id, transcript).await {
            warn!("Failed to append build log for version {}: {}", version_id, e);
        }
    }
}
