use crate::CoreError;
use corral_kata::KataConfig;
use corral_runtime::RuntimeKind;
use corral_worktree::WorktreeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of `corral.toml`. A backend is available only when its table is
/// present.
///
/// ```toml
/// [worktree]
/// repo_path = "/srv/repos/app"
/// max_runtimes = 8
///
/// [kata]
/// namespace = "agents"
/// runtime_class = "kata-qemu"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorralConfig {
    #[serde(default)]
    pub worktree: Option<WorktreeConfig>,
    #[serde(default)]
    pub kata: Option<KataConfig>,
}

impl CorralConfig {
    /// Load config from `~/.config/corral/corral.toml`.
    pub fn load_default() -> Result<Self, CoreError> {
        let path = default_config_path()?;
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Backend kinds with a configuration table, in declaration order.
    pub fn configured_kinds(&self) -> Vec<RuntimeKind> {
        let mut kinds = Vec::new();
        if self.worktree.is_some() {
            kinds.push(RuntimeKind::Worktree);
        }
        if self.kata.is_some() {
            kinds.push(RuntimeKind::Kata);
        }
        kinds
    }
}

pub fn default_config_path() -> Result<PathBuf, CoreError> {
    let home = std::env::var("HOME").map_err(|_| CoreError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/corral/corral.toml"))
}
