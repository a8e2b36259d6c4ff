//! The version-control collaborator.
//!
//! The orchestration core never implements version-control logic; it calls
//! this narrow interface and never branches on which backend is active. One
//! implementation per backend.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Failures surfaced by a VCS backend.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("branch operation failed: {0}")]
    Branch(String),

    #[error("workspace allocation failed: {0}")]
    Workspace(String),

    #[error("merge of '{branch}' failed: {detail}")]
    Merge { branch: String, detail: String },

    #[error("push failed: {0}")]
    Push(String),
}

/// Branch, workspace, merge, and push operations the engine delegates.
pub trait Vcs: Send + Sync {
    /// Cheap sanity check before a graph-wide operation (clean tree,
    /// reachable remote).
    fn preflight(&self) -> Result<(), VcsError>;

    fn create_branch(&self, name: &str) -> Result<(), VcsError>;

    /// Allocate an isolated workspace checked out on `branch`, rooted at
    /// `dest`. Returns the workspace path.
    fn create_workspace(&self, branch: &str, dest: &Path) -> Result<PathBuf, VcsError>;

    fn merge(&self, branch: &str) -> Result<(), VcsError>;

    fn push(&self) -> Result<(), VcsError>;
}

/// Git backend: shells out to `git` in a fixed repository directory.
pub struct GitVcs {
    repo: PathBuf,
}

impl GitVcs {
    pub fn new(repo: PathBuf) -> Self {
        Self { repo }
    }

    fn git(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Vcs for GitVcs {
    fn preflight(&self) -> Result<(), VcsError> {
        let status = self
            .git(&["status", "--porcelain"])
            .map_err(VcsError::Preflight)?;
        if status.trim().is_empty() {
            Ok(())
        } else {
            Err(VcsError::Preflight(
                "working tree has uncommitted changes".into(),
            ))
        }
    }

    fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.git(&["branch", name]).map_err(VcsError::Branch)?;
        Ok(())
    }

    fn create_workspace(&self, branch: &str, dest: &Path) -> Result<PathBuf, VcsError> {
        let dest_str = dest.to_str().ok_or_else(|| {
            VcsError::Workspace(format!("non-UTF-8 workspace path {}", dest.display()))
        })?;
        self.git(&["worktree", "add", dest_str, branch])
            .map_err(VcsError::Workspace)?;
        Ok(dest.to_path_buf())
    }

    fn merge(&self, branch: &str) -> Result<(), VcsError> {
        self.git(&["merge", "--no-ff", branch])
            .map_err(|detail| VcsError::Merge {
                branch: branch.to_string(),
                detail,
            })?;
        Ok(())
    }

    fn push(&self) -> Result<(), VcsError> {
        self.git(&["push"]).map_err(VcsError::Push)?;
        Ok(())
    }
}
