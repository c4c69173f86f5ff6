//! Git worktree runtime provider for Corral.
//!
//! A worktree runtime is an isolated working directory checked out on its own
//! branch of a shared repository clone. Isolation is process-level only: there
//! are no resource limits or network controls, and the provider says so in its
//! capabilities. Snapshots are commits pinned by a tag; restoring one checks out
//! a fresh worktree at that tag.

pub mod config;
mod exec;
pub mod git;
pub mod paths;
pub mod provider;

pub use config::WorktreeConfig;
pub use git::GitWorktreeManager;
pub use paths::resolve_within;
pub use provider::WorktreeRuntimeProvider;

use corral_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl GitError {
    pub fn command(&self) -> Option<&str> {
        match self {
            GitError::Launch { .. } => None,
            GitError::Failed { command, .. } => Some(command),
        }
    }

    /// Provisioning failures are retryable spawn errors.
    pub fn into_spawn_error(self) -> RuntimeError {
        let err = RuntimeError::spawn(self.to_string());
        match self.command() {
            Some(command) => err.with_context("command", format!("git {command}")),
            None => err,
        }
    }
}

impl From<GitError> for RuntimeError {
    fn from(err: GitError) -> Self {
        let code = match &err {
            GitError::Failed { code, .. } => *code,
            GitError::Launch { .. } => None,
        };
        let mapped = RuntimeError::execution(err.to_string(), code);
        match err.command() {
            Some(command) => mapped.with_context("command", format!("git {command}")),
            None => mapped,
        }
    }
}
