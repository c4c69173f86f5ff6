use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Backend family a runtime belongs to. The lowercase name doubles as the
/// runtime id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Worktree,
    Kata,
    E2b,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [RuntimeKind::Worktree, RuntimeKind::Kata, RuntimeKind::E2b];

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Worktree => "worktree",
            RuntimeKind::Kata => "kata",
            RuntimeKind::E2b => "e2b",
        }
    }

    /// Recover the backend kind from a runtime id of the form `<kind>-<seq>-<ts>`.
    pub fn from_runtime_id(id: &str) -> Option<Self> {
        let prefix = id.split('-').next()?;
        Self::ALL.into_iter().find(|k| k.as_str() == prefix)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Pending,
    Creating,
    Running,
    Paused,
    Terminating,
    Terminated,
    Error,
}

impl RuntimeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RuntimeState::Terminated | RuntimeState::Error)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::Pending => write!(f, "pending"),
            RuntimeState::Creating => write!(f, "creating"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Paused => write!(f, "paused"),
            RuntimeState::Terminating => write!(f, "terminating"),
            RuntimeState::Terminated => write!(f, "terminated"),
            RuntimeState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// Last-observed resource consumption of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Fractional cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: u64,
    /// Bytes.
    pub disk: u64,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<String>,
    /// Backend-specific facts: pod name, namespace, worktree path, branch.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RuntimeMetadata {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A provisioned sandbox instance. Callers only ever hold copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntime {
    pub id: String,
    pub runtime_type: RuntimeKind,
    pub state: RuntimeState,
    pub resources: ResourceUsage,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub metadata: RuntimeMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Point-in-time projection computed on every `get_status` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub id: String,
    pub state: RuntimeState,
    pub resources: ResourceUsage,
    pub health: HealthStatus,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl SnapshotMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Immutable point-in-time capture of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Source runtime; it may have been terminated since.
    pub runtime_id: String,
    pub created_at: DateTime<Utc>,
    /// Backend-estimated size in bytes.
    pub size: u64,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Fractional cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: u64,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub max_agents: Option<u32>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: 0.5,
            memory: 512 * 1024 * 1024,
            disk: None,
            max_agents: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMatch {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// One ingress or egress rule. Empty matcher lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    #[serde(default)]
    pub ports: Vec<PortMatch>,
    #[serde(default)]
    pub cidrs: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub name: String,
    #[serde(default)]
    pub ingress: Vec<NetworkRule>,
    #[serde(default)]
    pub egress: Vec<NetworkRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub policies: Vec<NetworkPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub source: PathBuf,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Input to `spawn`. Immutable once handed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Spawn deadline in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl SpawnConfig {
    pub fn new(runtime: RuntimeKind) -> Self {
        Self {
            runtime,
            resources: ResourceRequest::default(),
            network: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            image: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn network_policies(&self) -> &[NetworkPolicy] {
        self.network.as_ref().map_or(&[], |n| n.policies.as_slice())
    }
}

/// Selection criteria for `list_runtimes`. Terminated runtimes are never
/// listed regardless of the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeFilter {
    pub state: Option<RuntimeState>,
    pub labels: BTreeMap<String, String>,
}

impl RuntimeFilter {
    pub fn matches(&self, runtime: &AgentRuntime) -> bool {
        if let Some(state) = self.state {
            if runtime.state != state {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| runtime.metadata.labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_runtime_id() {
        assert_eq!(
            RuntimeKind::from_runtime_id("kata-4-1700000000000"),
            Some(RuntimeKind::Kata)
        );
        assert_eq!(
            RuntimeKind::from_runtime_id("worktree-1-1"),
            Some(RuntimeKind::Worktree)
        );
        assert_eq!(RuntimeKind::from_runtime_id("docker-1-1"), None);
        assert_eq!(RuntimeKind::from_runtime_id(""), None);
    }

    #[test]
    fn spawn_config_deserializes_with_defaults() {
        let config: SpawnConfig = serde_json::from_str(r#"{"runtime":"kata"}"#).unwrap();
        assert_eq!(config.runtime, RuntimeKind::Kata);
        assert_eq!(config.resources, ResourceRequest::default());
        assert!(config.network_policies().is_empty());
    }

    #[test]
    fn filter_matches_state_and_labels() {
        let now = Utc::now();
        let mut runtime = AgentRuntime {
            id: "worktree-1-1".to_owned(),
            runtime_type: RuntimeKind::Worktree,
            state: RuntimeState::Running,
            resources: ResourceUsage::default(),
            created_at: now,
            last_active_at: now,
            metadata: RuntimeMetadata::default(),
        };
        runtime
            .metadata
            .labels
            .insert("team".to_owned(), "core".to_owned());

        let mut filter = RuntimeFilter {
            state: Some(RuntimeState::Running),
            ..RuntimeFilter::default()
        };
        filter.labels.insert("team".to_owned(), "core".to_owned());
        assert!(filter.matches(&runtime));

        filter.labels.insert("team".to_owned(), "infra".to_owned());
        assert!(!filter.matches(&runtime));

        let paused = RuntimeFilter {
            state: Some(RuntimeState::Paused),
            ..RuntimeFilter::default()
        };
        assert!(!paused.matches(&runtime));
    }

    #[test]
    fn terminal_states() {
        assert!(RuntimeState::Terminated.is_terminal());
        assert!(RuntimeState::Error.is_terminal());
        assert!(!RuntimeState::Running.is_terminal());
    }
}
