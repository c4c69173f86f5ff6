use crate::config::CorralConfig;
use corral_kata::KataRuntimeProvider;
use corral_runtime::{
    AgentRuntime, Capability, EventHandler, EventKind, ExecutionOptions, ExecutionResult,
    InputStream, MissingResource, OutputStream, RuntimeError, RuntimeFilter, RuntimeKind,
    RuntimeProvider, RuntimeState, RuntimeStatus, Snapshot, SnapshotMetadata, SpawnConfig,
    SubscriptionId, SyncReport,
};
use corral_worktree::WorktreeRuntimeProvider;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Build the provider for `kind` from its table in `config`.
pub async fn select_provider(
    kind: RuntimeKind,
    config: &CorralConfig,
) -> Result<Arc<dyn RuntimeProvider>, RuntimeError> {
    match kind {
        RuntimeKind::Worktree => {
            let worktree = config.worktree.clone().ok_or_else(|| missing_table(kind))?;
            Ok(Arc::new(WorktreeRuntimeProvider::new(worktree)))
        }
        RuntimeKind::Kata => {
            let kata = config.kata.clone().ok_or_else(|| missing_table(kind))?;
            Ok(Arc::new(KataRuntimeProvider::connect(kata).await?))
        }
        RuntimeKind::E2b => Err(unavailable(kind)),
    }
}

fn missing_table(kind: RuntimeKind) -> RuntimeError {
    RuntimeError::configuration(format!("no [{kind}] table in configuration"))
        .with_context("runtime", kind)
}

fn unavailable(kind: RuntimeKind) -> RuntimeError {
    RuntimeError::configuration(format!("no {kind} provider is configured"))
        .with_context("runtime", kind)
}

/// Subscriptions registered on every provider by [`Engine::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSubscription(Vec<(RuntimeKind, SubscriptionId)>);

/// Routes runtime operations across several providers.
///
/// `spawn` goes to the provider named by `SpawnConfig::runtime`. Every call
/// addressed by runtime id goes to the provider whose kind matches the id
/// prefix. Snapshot ids carry no backend prefix, so snapshot calls ask each
/// snapshot-capable provider in turn.
#[derive(Default)]
pub struct Engine {
    providers: Vec<Arc<dyn RuntimeProvider>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a provider for every backend table present in `config`.
    pub async fn from_config(config: &CorralConfig) -> Result<Self, RuntimeError> {
        let mut engine = Self::new();
        for kind in config.configured_kinds() {
            engine.register(select_provider(kind, config).await?);
        }
        info!("engine ready with backends {:?}", engine.kinds());
        Ok(engine)
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn RuntimeProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Add a provider, returning the one it replaces for the same kind.
    pub fn register(
        &mut self,
        provider: Arc<dyn RuntimeProvider>,
    ) -> Option<Arc<dyn RuntimeProvider>> {
        let kind = provider.kind();
        match self.providers.iter_mut().find(|p| p.kind() == kind) {
            Some(slot) => Some(std::mem::replace(slot, provider)),
            None => {
                self.providers.push(provider);
                None
            }
        }
    }

    pub fn kinds(&self) -> Vec<RuntimeKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }

    pub fn provider(&self, kind: RuntimeKind) -> Option<&Arc<dyn RuntimeProvider>> {
        self.providers.iter().find(|p| p.kind() == kind)
    }

    fn provider_for_kind(&self, kind: RuntimeKind) -> Result<&Arc<dyn RuntimeProvider>, RuntimeError> {
        self.provider(kind).ok_or_else(|| unavailable(kind))
    }

    fn route(&self, runtime_id: &str) -> Result<&Arc<dyn RuntimeProvider>, RuntimeError> {
        RuntimeKind::from_runtime_id(runtime_id)
            .and_then(|kind| self.provider(kind))
            .ok_or_else(|| RuntimeError::not_found(MissingResource::Runtime, runtime_id))
    }

    fn snapshot_providers(&self) -> impl Iterator<Item = &Arc<dyn RuntimeProvider>> {
        self.providers
            .iter()
            .filter(|p| p.capabilities().supports(Capability::Snapshots))
    }

    async fn route_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<&Arc<dyn RuntimeProvider>, RuntimeError> {
        for provider in self.snapshot_providers() {
            let snapshots = provider.list_snapshots(None).await?;
            if snapshots.iter().any(|s| s.id == snapshot_id) {
                debug!("snapshot {snapshot_id} belongs to {}", provider.kind());
                return Ok(provider);
            }
        }
        Err(RuntimeError::not_found(MissingResource::Snapshot, snapshot_id))
    }

    // --- Lifecycle ---

    pub async fn spawn(&self, config: SpawnConfig) -> Result<AgentRuntime, RuntimeError> {
        let provider = self.provider_for_kind(config.runtime)?;
        info!("routing spawn to {} provider", config.runtime);
        provider.spawn(config).await
    }

    pub async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.route(runtime_id)?.terminate(runtime_id).await
    }

    pub async fn get_status(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        self.route(runtime_id)?.get_status(runtime_id).await
    }

    pub async fn get_runtime(&self, runtime_id: &str) -> Result<AgentRuntime, RuntimeError> {
        self.route(runtime_id)?.get_runtime(runtime_id).await
    }

    /// Runtimes from every provider, oldest first.
    pub async fn list_runtimes(
        &self,
        filter: Option<&RuntimeFilter>,
    ) -> Result<Vec<AgentRuntime>, RuntimeError> {
        let mut all = Vec::new();
        for provider in &self.providers {
            all.extend(provider.list_runtimes(filter).await?);
        }
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    // --- Execution ---

    pub async fn execute(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        self.route(runtime_id)?
            .execute(runtime_id, command, options)
            .await
    }

    pub async fn execute_stream(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<OutputStream, RuntimeError> {
        self.route(runtime_id)?
            .execute_stream(runtime_id, command, options)
            .await
    }

    pub async fn execute_interactive(
        &self,
        runtime_id: &str,
        command: &str,
        stdin: InputStream,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        self.route(runtime_id)?
            .execute_interactive(runtime_id, command, stdin, options)
            .await
    }

    // --- Files ---

    pub async fn read_file(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.route(runtime_id)?.read_file(runtime_id, path).await
    }

    pub async fn write_file(
        &self,
        runtime_id: &str,
        path: &str,
        data: &[u8],
    ) -> Result<(), RuntimeError> {
        self.route(runtime_id)?
            .write_file(runtime_id, path, data)
            .await
    }

    pub async fn upload_directory(
        &self,
        runtime_id: &str,
        host_dir: &Path,
        remote_dir: &str,
    ) -> Result<SyncReport, RuntimeError> {
        self.route(runtime_id)?
            .upload_directory(runtime_id, host_dir, remote_dir)
            .await
    }

    pub async fn download_directory(
        &self,
        runtime_id: &str,
        remote_dir: &str,
        host_dir: &Path,
    ) -> Result<SyncReport, RuntimeError> {
        self.route(runtime_id)?
            .download_directory(runtime_id, remote_dir, host_dir)
            .await
    }

    // --- Snapshots ---

    pub async fn snapshot(
        &self,
        runtime_id: &str,
        metadata: SnapshotMetadata,
    ) -> Result<Snapshot, RuntimeError> {
        self.route(runtime_id)?.snapshot(runtime_id, metadata).await
    }

    pub async fn restore(&self, snapshot_id: &str) -> Result<AgentRuntime, RuntimeError> {
        self.route_snapshot(snapshot_id)
            .await?
            .restore(snapshot_id)
            .await
    }

    pub async fn list_snapshots(
        &self,
        runtime_id: Option<&str>,
    ) -> Result<Vec<Snapshot>, RuntimeError> {
        if let Some(id) = runtime_id {
            return self.route(id)?.list_snapshots(Some(id)).await;
        }
        let mut all = Vec::new();
        for provider in self.snapshot_providers() {
            all.extend(provider.list_snapshots(None).await?);
        }
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), RuntimeError> {
        self.route_snapshot(snapshot_id)
            .await?
            .delete_snapshot(snapshot_id)
            .await
    }

    // --- Events and waiting ---

    /// Register `handler` with every provider.
    pub fn subscribe(&self, kind: Option<EventKind>, handler: &EventHandler) -> EngineSubscription {
        EngineSubscription(
            self.providers
                .iter()
                .map(|p| (p.kind(), p.subscribe(kind, Arc::clone(handler))))
                .collect(),
        )
    }

    pub fn unsubscribe(&self, subscription: &EngineSubscription) -> bool {
        let mut removed = false;
        for (kind, id) in &subscription.0 {
            if let Some(provider) = self.provider(*kind) {
                removed |= provider.unsubscribe(*id);
            }
        }
        removed
    }

    pub async fn wait_for_state(
        &self,
        runtime_id: &str,
        state: RuntimeState,
        timeout: Duration,
    ) -> Result<bool, RuntimeError> {
        self.route(runtime_id)?
            .wait_for_state(runtime_id, state, timeout)
            .await
    }

    // --- Background work ---

    pub fn start_health_monitoring(&self) {
        for provider in &self.providers {
            provider.start_health_monitoring();
        }
    }

    pub fn stop_health_monitoring(&self) {
        for provider in &self.providers {
            provider.stop_health_monitoring();
        }
    }

    /// Dispose every provider, returning the first failure after all have run.
    pub async fn dispose(&self) -> Result<(), RuntimeError> {
        let mut first = None;
        for provider in &self.providers {
            if let Err(e) = provider.dispose().await {
                warn!("disposing {} provider failed: {e}", provider.kind());
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
