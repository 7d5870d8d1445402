use thiserror::Error;

use crate::tool::ToolError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{0}")]
    Tool(#[from] ToolError),

    #[error("AI code generation failed: {0}")]
    Agent(String),

    /// Carries the combined prebuild output so the repair prompt can show
    /// the agent everything the tool printed.
    #[error("{0}")]
    Prebuild(String),

    #[error("deployment failed: {0}")]
    Deploy(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Workspace(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
