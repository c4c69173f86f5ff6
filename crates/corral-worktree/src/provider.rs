use crate::config::WorktreeConfig;
use crate::exec;
use crate::git::{GitWorktreeManager, SNAPSHOT_TAG_PREFIX};
use crate::paths::resolve_within;
use async_trait::async_trait;
use chrono::Utc;
use corral_runtime::{
    next_runtime_id, next_snapshot_id, resource_warning, Admission, AgentRuntime, Capabilities,
    Capability, EventHandler, EventKind, ExecutionOptions, ExecutionResult, FileSyncEngine,
    FileTransport, HealthMonitor, HealthProbe, HealthStatus, HostFiles, InputStream, OutputStream,
    ResourceType, ResourceUsage, RuntimeError, RuntimeEvent, RuntimeFilter, RuntimeKind,
    RuntimeMetadata, RuntimeProvider, RuntimeRegistry, RuntimeState, RuntimeStatus, Snapshot,
    SnapshotMetadata, SpawnConfig, SubscriptionId, SyncJob, SyncReport,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CAPABILITIES: Capabilities = Capabilities {
    snapshots: true,
    streaming: true,
    interactive: true,
    file_operations: true,
    network_configuration: false,
    resource_limits: false,
    health_checks: true,
};

/// Metadata attribute keys.
pub const ATTR_PATH: &str = "worktree.path";
pub const ATTR_BRANCH: &str = "worktree.branch";
pub const ATTR_BASE: &str = "worktree.base";

#[derive(Debug, Clone)]
struct WorktreeHandle {
    path: PathBuf,
    branch: String,
    config: Arc<SpawnConfig>,
}

#[derive(Debug, Clone)]
struct WorktreeSnapshot {
    tag: String,
    config: Arc<SpawnConfig>,
}

/// File access confined to one worktree. Every path goes through
/// [`resolve_within`]; git metadata is never listed.
struct WorktreeFiles {
    root: PathBuf,
}

impl WorktreeFiles {
    fn resolve(&self, path: &str) -> Result<String, RuntimeError> {
        Ok(resolve_within(&self.root, path)?.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl FileTransport for WorktreeFiles {
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, RuntimeError> {
        let resolved = self.resolve(dir)?;
        let mut files = HostFiles.list_files(&resolved).await?;
        let at_root = Path::new(&resolved) == self.root;
        if at_root {
            files.retain(|f| f != ".git" && !f.starts_with(".git/"));
        }
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        HostFiles.read_file(&self.resolve(path)?).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        HostFiles.write_file(&self.resolve(path)?, data).await
    }
}

/// Bytes used by a worktree, excluding git metadata.
async fn disk_usage(root: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if dir == root && entry.file_name() == ".git" {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

struct Inner {
    config: WorktreeConfig,
    git: GitWorktreeManager,
    registry: RuntimeRegistry<WorktreeHandle, WorktreeSnapshot>,
    admission: Admission,
    sync: FileSyncEngine,
}

impl Inner {
    /// Create a worktree runtime checked out at `start`.
    async fn provision(
        &self,
        config: Arc<SpawnConfig>,
        start: &str,
        restored_from: Option<&str>,
    ) -> Result<AgentRuntime, RuntimeError> {
        let permit = self.admission.admit(&config.resources)?;

        let id = next_runtime_id(RuntimeKind::Worktree);
        let branch = format!("{}{id}", self.config.branch_prefix);
        let root = self.config.worktree_root();
        let path = root.join(&id);

        let mut metadata = RuntimeMetadata {
            labels: config.labels.clone(),
            restored_from: restored_from.map(str::to_owned),
            attributes: BTreeMap::new(),
        };
        metadata
            .attributes
            .insert(ATTR_PATH.to_owned(), path.to_string_lossy().into_owned());
        metadata
            .attributes
            .insert(ATTR_BRANCH.to_owned(), branch.clone());
        metadata
            .attributes
            .insert(ATTR_BASE.to_owned(), start.to_owned());

        let handle = WorktreeHandle {
            path: path.clone(),
            branch: branch.clone(),
            config: Arc::clone(&config),
        };
        self.registry
            .insert_pending(&id, handle, metadata, Some(permit));
        self.registry.transition(&id, RuntimeState::Creating)?;

        let created = async {
            tokio::fs::create_dir_all(&root).await.map_err(|e| {
                RuntimeError::spawn(format!("cannot create worktree root: {e}"))
                    .with_context("path", root.display())
            })?;
            self.git
                .add_worktree(&path, &branch, start)
                .await
                .map_err(crate::GitError::into_spawn_error)?;
            let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                RuntimeError::spawn(format!("worktree directory missing after add: {e}"))
            })?;
            if !meta.is_dir() || meta.permissions().readonly() {
                return Err(RuntimeError::spawn("worktree directory is not writable"));
            }
            Ok::<(), RuntimeError>(())
        };

        let result = match config.timeout {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, created).await {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::spawn(format!(
                        "worktree not ready within {secs}s"
                    ))
                    .with_context("timeout_ms", limit.as_millis())),
                }
            }
            None => created.await,
        };

        if let Err(err) = result {
            warn!("worktree spawn {id} failed: {err}");
            self.registry.discard(&id);
            self.cleanup(&path, &branch).await;
            return Err(err
                .with_runtime(&id)
                .with_context("branch", &branch)
                .with_context("start", start));
        }

        // A terminate issued while creating has already dropped the record.
        if let Err(err) = self.registry.transition(&id, RuntimeState::Running) {
            warn!("worktree spawn {id} cancelled: {err}");
            self.cleanup(&path, &branch).await;
            return Err(RuntimeError::spawn(format!(
                "runtime was terminated while starting: {err}"
            ))
            .with_runtime(&id)
            .with_context("branch", &branch));
        }
        info!("worktree runtime {id} running at {}", path.display());
        self.registry.get(&id)
    }

    /// Best-effort removal after a failed spawn.
    async fn cleanup(&self, path: &Path, branch: &str) {
        if let Err(e) = self.git.remove_worktree(path).await {
            warn!("cleanup of {} failed: {e}", path.display());
        }
        if let Err(e) = self.git.delete_branch(branch).await {
            warn!("cleanup of branch {branch} failed: {e}");
        }
    }

    async fn terminate(&self, id: &str) -> Result<(), RuntimeError> {
        if self.registry.is_terminated(id) {
            debug!("{id} already terminated");
            return Ok(());
        }
        let (runtime, handle) = self.registry.entry(id)?;
        if runtime.state != RuntimeState::Terminating {
            self.registry.transition(id, RuntimeState::Terminating)?;
        }

        self.git
            .remove_worktree(&handle.path)
            .await
            .map_err(|e| RuntimeError::from(e).with_runtime(id))?;
        self.git
            .delete_branch(&handle.branch)
            .await
            .map_err(|e| RuntimeError::from(e).with_runtime(id))?;

        self.registry.finish_termination(id)?;
        info!("worktree runtime {id} terminated");
        Ok(())
    }

    fn files(handle: &WorktreeHandle) -> WorktreeFiles {
        WorktreeFiles {
            root: handle.path.clone(),
        }
    }

    fn command(
        &self,
        id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<(tokio::process::Command, Duration), RuntimeError> {
        let (_, handle) = self.registry.running(id)?;
        let cwd = resolve_within(&handle.path, options.cwd.as_deref().unwrap_or("."))
            .map_err(|e| e.with_runtime(id))?;
        let mut env = handle.config.env.clone();
        env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let timeout = options.timeout.unwrap_or_else(|| self.config.exec_timeout());
        debug!("{id}: exec `{command}` in {}", cwd.display());
        Ok((exec::shell(&cwd, command, &env), timeout))
    }
}

#[async_trait]
impl HealthProbe for Inner {
    async fn probe_all(&self) {
        for (runtime, handle) in self.registry.live() {
            if runtime.state != RuntimeState::Running {
                continue;
            }
            let id = runtime.id.as_str();
            let healthy = tokio::fs::metadata(&handle.path)
                .await
                .is_ok_and(|m| m.is_dir());

            if !healthy {
                let err = RuntimeError::execution("worktree directory disappeared", None)
                    .with_runtime(id)
                    .with_context("path", handle.path.display());
                warn!("{id}: {err}");
                if let Err(e) = self.registry.fail(id, &err) {
                    debug!("{id}: could not mark failed: {e}");
                }
                self.registry
                    .events()
                    .emit(&RuntimeEvent::health_check(id, HealthStatus::Unhealthy));
                continue;
            }

            if let Ok(disk) = disk_usage(&handle.path).await {
                let usage = ResourceUsage {
                    disk,
                    ..runtime.resources
                };
                // The runtime may have been terminated since the listing.
                let _ = self.registry.update_resources(id, usage);
                if let Some(limit) = handle.config.resources.disk {
                    if let Some(event) =
                        resource_warning(id, ResourceType::Disk, disk as f64, limit as f64)
                    {
                        self.registry.events().emit(&event);
                    }
                }
            }
            self.registry
                .events()
                .emit(&RuntimeEvent::health_check(id, HealthStatus::Healthy));
        }
    }
}

/// Runtime provider backed by git worktrees of a single repository clone.
pub struct WorktreeRuntimeProvider {
    inner: Arc<Inner>,
    monitor: HealthMonitor,
}

impl WorktreeRuntimeProvider {
    pub fn new(config: WorktreeConfig) -> Self {
        let git = GitWorktreeManager::new(&config.repo_path, &config.git_binary);
        let monitor = HealthMonitor::new(config.health_interval());
        let inner = Inner {
            admission: Admission::new(config.max_runtimes, None),
            sync: FileSyncEngine::new(config.sync),
            registry: RuntimeRegistry::new(RuntimeKind::Worktree),
            git,
            config,
        };
        Self {
            inner: Arc::new(inner),
            monitor,
        }
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.inner.config
    }

    fn validate(config: &SpawnConfig) -> Result<(), RuntimeError> {
        if config.runtime != RuntimeKind::Worktree {
            return Err(RuntimeError::configuration(format!(
                "spawn config targets {} runtime, not worktree",
                config.runtime
            ))
            .with_context("runtime", config.runtime));
        }
        if !config.network_policies().is_empty() {
            CAPABILITIES.require(Capability::NetworkConfiguration, RuntimeKind::Worktree)?;
        }
        if !config.volumes.is_empty() {
            return Err(RuntimeError::configuration(
                "worktree runtimes cannot mount volumes",
            )
            .with_context("volumes", config.volumes.len()));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeProvider for WorktreeRuntimeProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Worktree
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<AgentRuntime, RuntimeError> {
        Self::validate(&config)?;
        let base = self.inner.config.base_ref.clone();
        self.inner.provision(Arc::new(config), &base, None).await
    }

    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.inner.terminate(runtime_id).await
    }

    async fn get_status(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let (runtime, handle) = self.inner.registry.entry(runtime_id)?;
        let mut resources = runtime.resources;
        let health = match runtime.state {
            RuntimeState::Running => match disk_usage(&handle.path).await {
                Ok(disk) => {
                    resources.disk = disk;
                    let _ = self.inner.registry.update_resources(runtime_id, resources);
                    HealthStatus::Healthy
                }
                Err(_) => HealthStatus::Unhealthy,
            },
            RuntimeState::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        };
        let uptime = (Utc::now() - runtime.created_at).num_milliseconds().max(0);
        Ok(RuntimeStatus {
            id: runtime.id,
            state: runtime.state,
            resources,
            health,
            uptime_ms: uptime as u64,
        })
    }

    async fn get_runtime(&self, runtime_id: &str) -> Result<AgentRuntime, RuntimeError> {
        self.inner.registry.get(runtime_id)
    }

    async fn list_runtimes(
        &self,
        filter: Option<&RuntimeFilter>,
    ) -> Result<Vec<AgentRuntime>, RuntimeError> {
        Ok(self.inner.registry.list(filter))
    }

    async fn execute(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let (cmd, timeout) = self.inner.command(runtime_id, command, options)?;
        exec::run(cmd, command, None, timeout)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    async fn execute_stream(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<OutputStream, RuntimeError> {
        let (cmd, timeout) = self.inner.command(runtime_id, command, options)?;
        exec::stream(cmd, command, timeout).map_err(|e| e.with_runtime(runtime_id))
    }

    async fn execute_interactive(
        &self,
        runtime_id: &str,
        command: &str,
        stdin: InputStream,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let (cmd, timeout) = self.inner.command(runtime_id, command, options)?;
        exec::run(cmd, command, Some(stdin), timeout)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    async fn read_file(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        Inner::files(&handle)
            .read_file(path)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    async fn write_file(
        &self,
        runtime_id: &str,
        path: &str,
        data: &[u8],
    ) -> Result<(), RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        Inner::files(&handle)
            .write_file(path, data)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    async fn upload_directory(
        &self,
        runtime_id: &str,
        host_dir: &Path,
        remote_dir: &str,
    ) -> Result<SyncReport, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        let job = SyncJob::new(
            format!("{runtime_id}:upload"),
            Arc::new(HostFiles),
            host_dir.to_string_lossy(),
            Arc::new(Inner::files(&handle)),
            remote_dir,
        );
        self.inner
            .sync
            .sync(&job)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    async fn download_directory(
        &self,
        runtime_id: &str,
        remote_dir: &str,
        host_dir: &Path,
    ) -> Result<SyncReport, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        let job = SyncJob::new(
            format!("{runtime_id}:download"),
            Arc::new(Inner::files(&handle)),
            remote_dir,
            Arc::new(HostFiles),
            host_dir.to_string_lossy(),
        );
        self.inner
            .sync
            .sync(&job)
            .await
            .map_err(|e| e.with_runtime(runtime_id))
    }

    /// Commit the worktree and pin the commit with a tag. Concurrent writes
    /// during the commit are not sequenced; callers quiesce the runtime first.
    async fn snapshot(
        &self,
        runtime_id: &str,
        metadata: SnapshotMetadata,
    ) -> Result<Snapshot, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        let snapshot_id = next_snapshot_id();
        let message = metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("corral snapshot {snapshot_id}"));

        let commit = self
            .inner
            .git
            .commit_all(&handle.path, &message)
            .await
            .map_err(|e| RuntimeError::from(e).with_runtime(runtime_id))?;
        let tag = format!("{SNAPSHOT_TAG_PREFIX}{snapshot_id}");
        self.inner
            .git
            .create_tag(&tag, &commit)
            .await
            .map_err(|e| RuntimeError::from(e).with_runtime(runtime_id))?;

        let size = disk_usage(&handle.path).await.unwrap_or(0);
        let snapshot = Snapshot {
            id: snapshot_id,
            runtime_id: runtime_id.to_owned(),
            created_at: Utc::now(),
            size,
            metadata,
        };
        self.inner.registry.insert_snapshot(
            snapshot.clone(),
            WorktreeSnapshot {
                tag,
                config: Arc::clone(&handle.config),
            },
        );
        info!("snapshot {} of {runtime_id} at {commit}", snapshot.id);
        Ok(snapshot)
    }

    async fn restore(&self, snapshot_id: &str) -> Result<AgentRuntime, RuntimeError> {
        let (_, payload) = self.inner.registry.snapshot(snapshot_id)?;
        let runtime = self
            .inner
            .provision(payload.config, &payload.tag, Some(snapshot_id))
            .await?;
        info!("restored snapshot {snapshot_id} into {}", runtime.id);
        Ok(runtime)
    }

    async fn list_snapshots(&self, runtime_id: Option<&str>) -> Result<Vec<Snapshot>, RuntimeError> {
        Ok(self.inner.registry.list_snapshots(runtime_id))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), RuntimeError> {
        let (_, payload) = self.inner.registry.snapshot(snapshot_id)?;
        self.inner.git.delete_tag(&payload.tag).await?;
        self.inner.registry.remove_snapshot(snapshot_id)?;
        info!("deleted snapshot {snapshot_id}");
        Ok(())
    }

    fn subscribe(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        self.inner.registry.events().subscribe(kind, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.events().unsubscribe(id)
    }

    async fn wait_for_state(
        &self,
        runtime_id: &str,
        state: RuntimeState,
        timeout: Duration,
    ) -> Result<bool, RuntimeError> {
        self.inner
            .registry
            .wait_for_state(runtime_id, state, timeout)
            .await
    }

    fn start_health_monitoring(&self) {
        self.monitor
            .start(Arc::clone(&self.inner) as Arc<dyn HealthProbe>);
    }

    fn stop_health_monitoring(&self) {
        self.monitor.stop();
    }

    async fn dispose(&self) -> Result<(), RuntimeError> {
        self.monitor.stop();
        let mut first_error = None;
        for (runtime, _) in self.inner.registry.live() {
            if let Err(e) = self.inner.terminate(&runtime.id).await {
                warn!("dispose: terminate {} failed: {e}", runtime.id);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
