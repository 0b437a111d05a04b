//! Working directories for agent processes.
//!
//! Isolated workspaces live under `<base>/sessions/<session_id>` and are
//! removed on cleanup. Persistent workspaces live under
//! `<base>/users/<hash of user id>` and survive across sessions.

use ptyhub_core::{HubError, HubResult, WorkspaceType};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
    kind: WorkspaceType,
}

impl Workspace {
    /// Create (or reuse, for persistent) the directory for a new session.
    pub fn allocate(
        base: &Path,
        kind: WorkspaceType,
        user_id: &str,
        session_id: &str,
    ) -> HubResult<Self> {
        let path = match kind {
            WorkspaceType::Isolated => {
                let parent = base.join("sessions");
                std::fs::create_dir_all(&parent).map_err(|e| workspace_error(&parent, e))?;
                let path = parent.join(session_id);
                // create_dir, not create_dir_all: an existing directory is an error
                std::fs::create_dir(&path).map_err(|e| workspace_error(&path, e))?;
                path
            }
            WorkspaceType::Persistent => {
                let path = base.join("users").join(user_dir_name(user_id));
                std::fs::create_dir_all(&path).map_err(|e| workspace_error(&path, e))?;
                path
            }
        };

        debug!(path = %path.display(), ?kind, "workspace ready");
        Ok(Self { path, kind })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> WorkspaceType {
        self.kind
    }

    /// Remove the directory if it is isolated. Safe to call repeatedly.
    pub fn release(&self) -> HubResult<()> {
        if self.kind != WorkspaceType::Isolated {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(workspace_error(&self.path, e)),
        }
    }
}

/// Deterministic directory name for a user, independent of which characters
/// the user id contains.
fn user_dir_name(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    hex::encode(&digest[..16])
}

fn workspace_error(path: &Path, e: std::io::Error) -> HubError {
    HubError::Workspace(format!("{}: {e}", path.display()))
}
