//! Runtime provider contract and shared machinery for Corral.
//!
//! This crate defines the `RuntimeProvider` trait every isolation backend
//! implements, the closed `RuntimeError` taxonomy, the lifecycle state machine,
//! the per-provider event bus, and the registry providers use to track runtimes
//! and snapshots. It also carries the pieces backends share: admission control,
//! periodic health monitoring, and a directory sync engine built on single-file
//! transfers.

pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod provider;
pub mod registry;
pub mod sync;
pub mod types;

pub use error::{ErrorCode, ErrorContext, MissingResource, ResourceType, RuntimeError};
pub use events::{EventBus, EventHandler, EventKind, RuntimeEvent, SubscriptionId};
pub use health::{resource_warning, HealthMonitor, HealthProbe};
pub use lifecycle::validate_transition;
pub use provider::{
    Capabilities, Capability, ExecutionOptions, ExecutionResult, InputStream, OutputChunk,
    OutputStream, RuntimeProvider,
};
pub use registry::{
    next_runtime_id, next_snapshot_id, Admission, AdmissionPermit, ResourceQuota, RuntimeRegistry,
};
pub use sync::{
    FileSyncEngine, FileTransport, HostFiles, SyncConfig, SyncFailure, SyncJob, SyncProgress,
    SyncReport,
};
pub use types::{
    AgentRuntime, HealthStatus, NetworkConfig, NetworkMode, NetworkPolicy, NetworkRule,
    NetworkStats, PortMatch, Protocol, ResourceRequest, ResourceUsage, RuntimeFilter, RuntimeKind,
    RuntimeMetadata, RuntimeState, RuntimeStatus, Snapshot, SnapshotMetadata, SpawnConfig,
    VolumeMount,
};
