use crate::events::{EventHandler, EventKind, SubscriptionId};
use crate::sync::SyncReport;
use crate::types::{
    AgentRuntime, RuntimeFilter, RuntimeKind, RuntimeState, RuntimeStatus, Snapshot,
    SnapshotMetadata, SpawnConfig,
};
use crate::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Optional operation categories a provider may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Snapshots,
    Streaming,
    Interactive,
    FileOperations,
    NetworkConfiguration,
    ResourceLimits,
    HealthChecks,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Snapshots => "snapshots",
            Capability::Streaming => "streaming",
            Capability::Interactive => "interactive",
            Capability::FileOperations => "fileOperations",
            Capability::NetworkConfiguration => "networkConfiguration",
            Capability::ResourceLimits => "resourceLimits",
            Capability::HealthChecks => "healthChecks",
        };
        f.write_str(name)
    }
}

/// Static self-description of what a provider instance can do. Callers consult
/// this before invoking optional behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub snapshots: bool,
    pub streaming: bool,
    pub interactive: bool,
    pub file_operations: bool,
    pub network_configuration: bool,
    pub resource_limits: bool,
    pub health_checks: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Snapshots => self.snapshots,
            Capability::Streaming => self.streaming,
            Capability::Interactive => self.interactive,
            Capability::FileOperations => self.file_operations,
            Capability::NetworkConfiguration => self.network_configuration,
            Capability::ResourceLimits => self.resource_limits,
            Capability::HealthChecks => self.health_checks,
        }
    }

    /// Fail with `ConfigurationError` when `capability` is not advertised.
    pub fn require(&self, capability: Capability, kind: RuntimeKind) -> Result<(), RuntimeError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(RuntimeError::configuration(format!(
                "{kind} provider does not support {capability}"
            ))
            .with_context("capability", capability))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    /// Working directory; relative paths resolve against the runtime root.
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecutionOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from launch to exit.
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One increment of a streamed command. `Exit` is always the final item of a
/// stream that completes normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

pub type OutputStream = BoxStream<'static, Result<OutputChunk, RuntimeError>>;

/// Bytes piped to the stdin of an interactive command.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// The contract every runtime backend implements.
///
/// Operations on different runtime ids may run concurrently. Mutating
/// operations against the same id are not serialized by the provider.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn capabilities(&self) -> Capabilities;

    // --- Lifecycle ---
    async fn spawn(&self, config: SpawnConfig) -> Result<AgentRuntime, RuntimeError>;

    /// Idempotent: terminating an already-terminated runtime succeeds.
    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError>;

    async fn get_status(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError>;

    async fn get_runtime(&self, runtime_id: &str) -> Result<AgentRuntime, RuntimeError>;

    async fn list_runtimes(
        &self,
        filter: Option<&RuntimeFilter>,
    ) -> Result<Vec<AgentRuntime>, RuntimeError>;

    // --- Execution ---
    async fn execute(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError>;

    async fn execute_stream(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<OutputStream, RuntimeError>;

    async fn execute_interactive(
        &self,
        runtime_id: &str,
        command: &str,
        stdin: InputStream,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError>;

    // --- Files ---
    async fn read_file(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn write_file(&self, runtime_id: &str, path: &str, data: &[u8])
        -> Result<(), RuntimeError>;

    async fn upload_directory(
        &self,
        runtime_id: &str,
        host_dir: &Path,
        remote_dir: &str,
    ) -> Result<SyncReport, RuntimeError>;

    async fn download_directory(
        &self,
        runtime_id: &str,
        remote_dir: &str,
        host_dir: &Path,
    ) -> Result<SyncReport, RuntimeError>;

    // --- Snapshots ---
    async fn snapshot(
        &self,
        runtime_id: &str,
        metadata: SnapshotMetadata,
    ) -> Result<Snapshot, RuntimeError>;

    /// Always produces a new runtime with its own id.
    async fn restore(&self, snapshot_id: &str) -> Result<AgentRuntime, RuntimeError>;

    async fn list_snapshots(&self, runtime_id: Option<&str>) -> Result<Vec<Snapshot>, RuntimeError>;

    /// Not idempotent: deleting an unknown snapshot raises `NotFound`.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), RuntimeError>;

    // --- Events and waiting ---
    fn subscribe(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Resolve `true` once the runtime reaches `state`, `false` on timeout.
    async fn wait_for_state(
        &self,
        runtime_id: &str,
        state: RuntimeState,
        timeout: Duration,
    ) -> Result<bool, RuntimeError>;

    // --- Background work ---
    /// Start the periodic health monitor. Must be called within a tokio runtime.
    fn start_health_monitoring(&self);

    fn stop_health_monitoring(&self);

    /// Stop background work and terminate every live runtime.
    async fn dispose(&self) -> Result<(), RuntimeError>;
}
