use corral_runtime::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Existing repository clone every worktree branches from.
    pub repo_path: PathBuf,
    /// Where worktree directories are created. Defaults to
    /// `$TMPDIR/corral/worktrees`.
    #[serde(default)]
    pub worktree_root: Option<PathBuf>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Ref new runtimes are checked out from.
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default)]
    pub max_runtimes: Option<usize>,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_branch_prefix() -> String {
    "corral/".to_owned()
}

fn default_base_ref() -> String {
    "HEAD".to_owned()
}

fn default_exec_timeout_secs() -> u64 {
    300
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_git_binary() -> String {
    "git".to_owned()
}

impl WorktreeConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktree_root: None,
            branch_prefix: default_branch_prefix(),
            base_ref: default_base_ref(),
            max_runtimes: None,
            exec_timeout_secs: default_exec_timeout_secs(),
            health_interval_ms: default_health_interval_ms(),
            git_binary: default_git_binary(),
            sync: SyncConfig::default(),
        }
    }

    #[must_use]
    pub fn with_worktree_root(mut self, root: impl AsRef<Path>) -> Self {
        self.worktree_root = Some(root.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn with_max_runtimes(mut self, max: usize) -> Self {
        self.max_runtimes = Some(max);
        self
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.worktree_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("corral").join("worktrees"))
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}
