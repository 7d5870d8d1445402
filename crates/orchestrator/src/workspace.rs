//! Per-build workspace lifecycle.
//!
//! Workspaces are named by app id under a configured base directory, so
//! the most recent build of an app is always at a known path. The flip
//! side: two concurrent builds of one app would share a directory, which
//! is why the API serializes version creation per app.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use storage::archive::is_excluded;

use crate::error::{OrchestratorError, Result};

pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create (or reuse) the workspace directory for an app. The returned
    /// guard removes the directory when dropped, on every exit path.
    pub fn create(&self, app_id: &str) -> Result<Workspace> {
        let root = self.base_dir.join(app_id);
        fs::create_dir_all(&root).map_err(|e| {
            OrchestratorError::Workspace(format!(
                "failed to create workspace {:?}: {}",
                root, e
            ))
        })?;
        info!("Created workspace at {:?}", root);
        Ok(Workspace { root })
    }
}

pub struct Workspace {
    root: PathBuf,
}

#[derive(Deserialize)]
struct ProjectDescriptor {
    #[serde(rename = "projectId")]
    project_id: String,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `schemas/` directory the agent may have produced.
    pub fn schemas_dir(&self) -> PathBuf {
        self.root.join("schemas")
    }

    /// Hosting-provider project id from the descriptor written by `link`.
    pub fn provider_project_id(&self) -> Result<String> {
        let descriptor_path = self.root.join(".vercel").join("project.json");
        let data = fs::read_to_string(&descriptor_path).map_err(|e| {
            OrchestratorError::Workspace(format!(
                "failed to read {:?}: {}",
                descriptor_path, e
            ))
        })?;
        let descriptor: ProjectDescriptor = serde_json::from_str(&data).map_err(|e| {
            OrchestratorError::Workspace(format!(
                "failed to parse {:?}: {}",
                descriptor_path, e
            ))
        })?;
        Ok(descriptor.project_id)
    }

    /// Mirror a starter tree into the workspace, skipping the excluded
    /// prefixes. Symlinks are not followed.
    pub fn mirror_starter(&self, starter_dir: &Path) -> Result<()> {
        if !starter_dir.is_dir() {
            return Err(OrchestratorError::Workspace(format!(
                "starter code directory does not exist: {:?}",
                starter_dir
            )));
        }

        for entry in WalkDir::new(starter_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if entry.path() == starter_dir {
                    return true;
                }
                match entry.path().strip_prefix(starter_dir) {
                    Ok(relative) => !is_excluded(relative),
                    Err(_) => false,
                }
            })
        {
            let entry = entry.map_err(|e| {
                OrchestratorError::Workspace(format!("failed to walk starter tree: {}", e))
            })?;
            let relative = entry
                .path()
                .strip_prefix(starter_dir)
                .map_err(|e| OrchestratorError::Workspace(e.to_string()))?;
            if relative.as_os_str().is_empty() {
                continue;
            }

            let target = self.root.join(relative);
            let copy_result = if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
            } else if entry.file_type().is_symlink() {
                debug!("Skipping symlink in starter tree: {:?}", relative);
                continue;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target).map(|_| ())
            };
            copy_result.map_err(|e| {
                OrchestratorError::Workspace(format!(
                    "failed to copy {:?} into workspace: {}",
                    relative, e
                ))
            })?;
        }

        info!("Seeded workspace from starter tree {:?}", starter_dir);
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if self.root.exists() {
                error!("Failed to clean up workspace {:?}: {}", self.root, e);
            }
        } else {
            debug!("Removed workspace {:?}", self.root);
        }
    }
}
