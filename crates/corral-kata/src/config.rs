use corral_runtime::{ResourceQuota, SyncConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Constructor configuration for the Kata provider. Cluster selection and
/// credentials come from the ambient kubeconfig, not from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KataConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// `RuntimeClass` selecting the micro-VM container runtime.
    #[serde(default = "default_runtime_class")]
    pub runtime_class: String,
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub max_runtimes: Option<usize>,
    #[serde(default)]
    pub quota: Option<ResourceQuota>,
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// YAML pod template with `{{VAR}}` placeholders.
    #[serde(default)]
    pub pod_template: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn default_runtime_class() -> String {
    "kata".to_owned()
}

fn default_image() -> String {
    "ubuntu:22.04".to_owned()
}

fn default_workdir() -> String {
    "/workspace".to_owned()
}

fn default_spawn_timeout_ms() -> u64 {
    120_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_exec_timeout_secs() -> u64 {
    300
}

fn default_health_interval_ms() -> u64 {
    30_000
}

impl Default for KataConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            runtime_class: default_runtime_class(),
            default_image: default_image(),
            service_account: None,
            workdir: default_workdir(),
            max_runtimes: None,
            quota: None,
            spawn_timeout_ms: default_spawn_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            exec_timeout_secs: default_exec_timeout_secs(),
            health_interval_ms: default_health_interval_ms(),
            pod_template: None,
            sync: SyncConfig::default(),
        }
    }
}

impl KataConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}
