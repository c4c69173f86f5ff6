use crate::api::{ApiError, PodApi};
use crate::cluster::KubePodApi;
use crate::config::KataConfig;
use crate::exec;
use crate::files::PodFiles;
use crate::network::{policies_for, to_kube};
use crate::pod::{build_pod, pod_name, readiness, Readiness, MEMORY_CURRENT};
use crate::shell::{absolute, quote};
use crate::template::PodTemplate;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use corral_runtime::{
    next_runtime_id, next_snapshot_id, resource_warning, Admission, AgentRuntime, Capabilities,
    EventHandler, EventKind, ExecutionOptions, ExecutionResult, FileSyncEngine, FileTransport,
    HealthMonitor, HealthProbe, HealthStatus, HostFiles, InputStream, OutputStream, ResourceType,
    ResourceUsage, RuntimeError, RuntimeEvent, RuntimeFilter, RuntimeKind, RuntimeMetadata,
    RuntimeProvider, RuntimeRegistry, RuntimeState, RuntimeStatus, Snapshot, SnapshotMetadata,
    SpawnConfig, SubscriptionId, SyncJob, SyncReport,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CAPABILITIES: Capabilities = Capabilities {
    snapshots: true,
    streaming: true,
    interactive: true,
    file_operations: true,
    network_configuration: true,
    resource_limits: true,
    health_checks: true,
};

/// Metadata attribute keys.
pub const ATTR_POD: &str = "kata.pod";
pub const ATTR_NAMESPACE: &str = "kata.namespace";

#[derive(Debug, Clone)]
struct PodHandle {
    pod: String,
    policies: Vec<String>,
    config: Arc<SpawnConfig>,
}

/// Workdir archive plus the config needed to recreate the pod.
#[derive(Debug, Clone)]
struct PodSnapshot {
    archive: Bytes,
    config: Arc<SpawnConfig>,
}

struct Inner {
    config: KataConfig,
    api: Arc<dyn PodApi>,
    template: Option<PodTemplate>,
    registry: RuntimeRegistry<PodHandle, PodSnapshot>,
    admission: Admission,
    sync: FileSyncEngine,
}

impl Inner {
    /// Create a pod for `config`, wait for it to become ready, apply its
    /// network policies and, when restoring, unpack `archive` into the workdir.
    async fn provision(
        &self,
        config: Arc<SpawnConfig>,
        archive: Option<Bytes>,
        restored_from: Option<&str>,
    ) -> Result<AgentRuntime, RuntimeError> {
        let permit = self.admission.admit(&config.resources)?;

        let id = next_runtime_id(RuntimeKind::Kata);
        let name = pod_name(&id);
        let pod = build_pod(&id, &self.config, &config, self.template.as_ref())
            .map_err(|e| e.with_runtime(&id))?;
        let policies = policies_for(config.network.as_ref())
            .iter()
            .map(|p| to_kube(&self.config.namespace, &id, p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut metadata = RuntimeMetadata {
            labels: config.labels.clone(),
            restored_from: restored_from.map(str::to_owned),
            attributes: BTreeMap::new(),
        };
        metadata.attributes.insert(ATTR_POD.to_owned(), name.clone());
        metadata
            .attributes
            .insert(ATTR_NAMESPACE.to_owned(), self.config.namespace.clone());

        let handle = PodHandle {
            pod: name.clone(),
            policies: policies
                .iter()
                .filter_map(|p| p.metadata.name.clone())
                .collect(),
            config: Arc::clone(&config),
        };
        let policy_names = handle.policies.clone();
        self.registry
            .insert_pending(&id, handle, metadata, Some(permit));
        self.registry.transition(&id, RuntimeState::Creating)?;

        let limit = config
            .timeout
            .map_or_else(|| self.config.spawn_timeout(), Duration::from_secs);
        let created = async {
            self.api
                .create_pod(&pod)
                .await
                .map_err(ApiError::into_spawn_error)?;
            debug!("{id}: pod {name} created");
            self.wait_ready(&name).await?;

            for policy in &policies {
                self.api.apply_network_policy(policy).await.map_err(|e| match e {
                    ApiError::Invalid(m) => {
                        RuntimeError::configuration(format!("network policy rejected: {m}"))
                    }
                    other => RuntimeError::spawn(format!("cannot apply network policy: {other}")),
                })?;
            }

            if let Some(archive) = archive {
                self.extract(&name, archive).await?;
            }
            Ok::<(), RuntimeError>(())
        };

        let result = match tokio::time::timeout(limit, created).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::spawn(format!(
                "pod {name} not ready within {}ms",
                limit.as_millis()
            ))
            .with_context("timeout_ms", limit.as_millis())),
        };

        if let Err(err) = result {
            warn!("kata spawn {id} failed: {err}");
            self.registry.discard(&id);
            self.cleanup(&name, &policy_names).await;
            return Err(err
                .with_runtime(&id)
                .with_context("pod", &name)
                .with_context("namespace", &self.config.namespace));
        }

        // A terminate issued while creating has already dropped the record.
        if let Err(err) = self.registry.transition(&id, RuntimeState::Running) {
            warn!("kata spawn {id} cancelled: {err}");
            self.cleanup(&name, &policy_names).await;
            return Err(RuntimeError::spawn(format!(
                "runtime was terminated while starting: {err}"
            ))
            .with_runtime(&id)
            .with_context("pod", &name)
            .with_context("namespace", &self.config.namespace));
        }
        info!("kata runtime {id} running as pod {name}");
        self.registry.get(&id)
    }

    async fn wait_ready(&self, name: &str) -> Result<(), RuntimeError> {
        loop {
            let pod = self
                .api
                .get_pod(name)
                .await
                .map_err(|e| RuntimeError::spawn(format!("cannot read pod status: {e}")))?
                .ok_or_else(|| RuntimeError::spawn(format!("pod {name} disappeared while starting")))?;
            match readiness(&pod) {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) => return Err(RuntimeError::spawn(reason)),
                Readiness::Waiting => tokio::time::sleep(self.config.poll_interval()).await,
            }
        }
    }

    async fn extract(&self, pod: &str, archive: Bytes) -> Result<(), RuntimeError> {
        let workdir = quote(&self.config.workdir);
        let script = format!("mkdir -p -- {workdir} && tar -C {workdir} -xf -");
        let input: InputStream = Box::new(std::io::Cursor::new(archive));
        let captured = exec::run(
            self.api.as_ref(),
            pod,
            script,
            Some(input),
            "restore",
            self.config.exec_timeout(),
        )
        .await?;
        if captured.exit_code != 0 {
            return Err(RuntimeError::spawn(format!(
                "cannot unpack snapshot: {}",
                captured.stderr_text()
            )));
        }
        Ok(())
    }

    /// Best-effort removal after a failed spawn.
    async fn cleanup(&self, pod: &str, policies: &[String]) {
        for policy in policies {
            match self.api.delete_network_policy(policy).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("cleanup of network policy {policy} failed: {e}"),
            }
        }
        match self.api.delete_pod(pod).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("cleanup of pod {pod} failed: {e}"),
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

        for policy in &handle.policies {
            match self.api.delete_network_policy(policy).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("{id}: network policy {policy} already gone"),
                Err(e) => {
                    return Err(RuntimeError::from(e)
                        .with_runtime(id)
                        .with_context("network_policy", policy))
                }
            }
        }
        match self.api.delete_pod(&handle.pod).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{id}: pod {} already gone", handle.pod),
            Err(e) => {
                return Err(RuntimeError::from(e)
                    .with_runtime(id)
                    .with_context("pod", &handle.pod))
            }
        }

        self.registry.finish_termination(id)?;
        info!("kata runtime {id} terminated");
        Ok(())
    }

    fn files(&self, handle: &PodHandle) -> PodFiles {
        PodFiles::new(
            Arc::clone(&self.api),
            &handle.pod,
            &self.config.workdir,
            self.config.exec_timeout(),
        )
    }

    fn command(
        &self,
        id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<(PodHandle, String, Duration), RuntimeError> {
        let (_, handle) = self.registry.running(id)?;
        let cwd = options.cwd.as_deref().map_or_else(
            || self.config.workdir.clone(),
            |cwd| absolute(&self.config.workdir, cwd),
        );
        let timeout = options.timeout.unwrap_or_else(|| self.config.exec_timeout());
        debug!("{id}: exec `{command}` in {}:{cwd}", handle.pod);
        Ok((handle, exec::script(&cwd, &options.env, command), timeout))
    }

    async fn run(
        &self,
        id: &str,
        command: &str,
        stdin: Option<InputStream>,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let (handle, script, timeout) = self.command(id, command, options)?;
        let started = Instant::now();
        let captured = exec::run(self.api.as_ref(), &handle.pod, script, stdin, "execute", timeout)
            .await
            .map_err(|e| e.with_runtime(id).with_context("command", command))?;
        Ok(ExecutionResult {
            exit_code: captured.exit_code,
            stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
            duration: started.elapsed(),
        })
    }

    /// Pod health as seen by the API server.
    async fn pod_health(&self, handle: &PodHandle) -> Result<Readiness, ApiError> {
        Ok(match self.api.get_pod(&handle.pod).await? {
            Some(pod) => readiness(&pod),
            None => Readiness::Failed(format!("pod {} no longer exists", handle.pod)),
        })
    }

    /// Current cgroup memory of the agent container, in bytes.
    async fn memory_usage(&self, handle: &PodHandle) -> Result<u64, RuntimeError> {
        let raw = self.files(handle).read_file(MEMORY_CURRENT).await?;
        String::from_utf8_lossy(&raw)
            .trim()
            .parse()
            .map_err(|e| RuntimeError::execution(format!("unreadable {MEMORY_CURRENT}: {e}"), None))
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
            let health = match self.pod_health(&handle).await {
                Ok(health) => health,
                Err(e) => {
                    debug!("{id}: health probe could not reach the API: {e}");
                    self.registry
                        .events()
                        .emit(&RuntimeEvent::health_check(id, HealthStatus::Unknown));
                    continue;
                }
            };

            match health {
                Readiness::Ready => {}
                Readiness::Waiting => {
                    self.registry
                        .events()
                        .emit(&RuntimeEvent::health_check(id, HealthStatus::Unhealthy));
                    continue;
                }
                Readiness::Failed(reason) => {
                    let err = RuntimeError::execution(reason, None)
                        .with_runtime(id)
                        .with_context("pod", &handle.pod);
                    warn!("{id}: {err}");
                    if let Err(e) = self.registry.fail(id, &err) {
                        debug!("{id}: could not mark failed: {e}");
                    }
                    self.registry
                        .events()
                        .emit(&RuntimeEvent::health_check(id, HealthStatus::Unhealthy));
                    continue;
                }
            }

            match self.memory_usage(&handle).await {
                Ok(memory) => {
                    let usage = ResourceUsage {
                        memory,
                        ..runtime.resources
                    };
                    // The runtime may have been terminated since the listing.
                    let _ = self.registry.update_resources(id, usage);
                    let limit = handle.config.resources.memory.saturating_mul(2);
                    if let Some(event) =
                        resource_warning(id, ResourceType::Memory, memory as f64, limit as f64)
                    {
                        self.registry.events().emit(&event);
                    }
                }
                Err(e) => debug!("{id}: memory sample failed: {e}"),
            }
            self.registry
                .events()
                .emit(&RuntimeEvent::health_check(id, HealthStatus::Healthy));
        }
    }
}

/// Runtime provider running each runtime as a pod whose `RuntimeClass`
/// selects the Kata micro-VM runtime.
pub struct KataRuntimeProvider {
    inner: Arc<Inner>,
    monitor: HealthMonitor,
}

impl KataRuntimeProvider {
    pub fn new(config: KataConfig, api: Arc<dyn PodApi>) -> Result<Self, RuntimeError> {
        if api.namespace() != config.namespace {
            return Err(RuntimeError::configuration(format!(
                "pod API is bound to namespace '{}', configuration names '{}'",
                api.namespace(),
                config.namespace
            )));
        }
        let template = config
            .pod_template
            .as_deref()
            .map(PodTemplate::load)
            .transpose()?;
        let monitor = HealthMonitor::new(config.health_interval());
        let inner = Inner {
            admission: Admission::new(config.max_runtimes, config.quota),
            sync: FileSyncEngine::new(config.sync),
            registry: RuntimeRegistry::new(RuntimeKind::Kata),
            template,
            api,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
            monitor,
        })
    }

    /// Connect to the cluster named by the ambient kubeconfig.
    pub async fn connect(config: KataConfig) -> Result<Self, RuntimeError> {
        let api = KubePodApi::try_default(&config.namespace)
            .await
            .map_err(|e| RuntimeError::configuration(format!("cannot connect to cluster: {e}")))?;
        Self::new(config, Arc::new(api))
    }

    pub fn config(&self) -> &KataConfig {
        &self.inner.config
    }

    fn validate(config: &SpawnConfig) -> Result<(), RuntimeError> {
        if config.runtime != RuntimeKind::Kata {
            return Err(RuntimeError::configuration(format!(
                "spawn config targets {} runtime, not kata",
                config.runtime
            ))
            .with_context("runtime", config.runtime));
        }
        if config.resources.cpu <= 0.0 || config.resources.memory == 0 {
            return Err(RuntimeError::configuration(
                "cpu and memory requests must be positive",
            )
            .with_context("cpu", config.resources.cpu)
            .with_context("memory", config.resources.memory));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeProvider for KataRuntimeProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Kata
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<AgentRuntime, RuntimeError> {
        Self::validate(&config)?;
        self.inner.provision(Arc::new(config), None, None).await
    }

    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.inner.terminate(runtime_id).await
    }

    async fn get_status(&self, runtime_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let (runtime, handle) = self.inner.registry.entry(runtime_id)?;
        let health = match runtime.state {
            RuntimeState::Running => match self.inner.pod_health(&handle).await {
                Ok(Readiness::Ready) => HealthStatus::Healthy,
                Ok(_) => HealthStatus::Unhealthy,
                Err(e) => {
                    debug!("{runtime_id}: status probe failed: {e}");
                    HealthStatus::Unknown
                }
            },
            RuntimeState::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        };
        let uptime = (Utc::now() - runtime.created_at).num_milliseconds().max(0);
        Ok(RuntimeStatus {
            id: runtime.id,
            state: runtime.state,
            resources: runtime.resources,
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
        self.inner.run(runtime_id, command, None, options).await
    }

    async fn execute_stream(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecutionOptions,
    ) -> Result<OutputStream, RuntimeError> {
        let (handle, script, timeout) = self.inner.command(runtime_id, command, options)?;
        let frames = self
            .inner
            .api
            .exec(&handle.pod, exec::sh(script), None)
            .await
            .map_err(|e| {
                RuntimeError::from(e)
                    .with_runtime(runtime_id)
                    .with_context("command", command)
            })?;
        Ok(exec::output(frames, command, timeout))
    }

    async fn execute_interactive(
        &self,
        runtime_id: &str,
        command: &str,
        stdin: InputStream,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        self.inner
            .run(runtime_id, command, Some(stdin), options)
            .await
    }

    async fn read_file(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        self.inner
            .files(&handle)
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
        self.inner
            .files(&handle)
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
            Arc::new(self.inner.files(&handle)),
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
            Arc::new(self.inner.files(&handle)),
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

    /// Archive the workdir over exec. The archive is held in memory by the
    /// provider; nothing outside the workdir is captured.
    async fn snapshot(
        &self,
        runtime_id: &str,
        metadata: SnapshotMetadata,
    ) -> Result<Snapshot, RuntimeError> {
        let (_, handle) = self.inner.registry.running(runtime_id)?;
        let workdir = &self.inner.config.workdir;
        let captured = exec::run(
            self.inner.api.as_ref(),
            &handle.pod,
            format!("tar -C {} -cf - .", quote(workdir)),
            None,
            "snapshot",
            self.inner.config.exec_timeout(),
        )
        .await
        .map_err(|e| e.with_runtime(runtime_id))?;
        if captured.exit_code != 0 {
            return Err(RuntimeError::execution(
                format!("cannot archive {workdir}: {}", captured.stderr_text()),
                Some(captured.exit_code),
            )
            .with_runtime(runtime_id));
        }

        let archive = Bytes::from(captured.stdout);
        let snapshot = Snapshot {
            id: next_snapshot_id(),
            runtime_id: runtime_id.to_owned(),
            created_at: Utc::now(),
            size: archive.len() as u64,
            metadata,
        };
        self.inner.registry.insert_snapshot(
            snapshot.clone(),
            PodSnapshot {
                archive,
                config: Arc::clone(&handle.config),
            },
        );
        info!(
            "snapshot {} of {runtime_id} ({} bytes)",
            snapshot.id, snapshot.size
        );
        Ok(snapshot)
    }

    async fn restore(&self, snapshot_id: &str) -> Result<AgentRuntime, RuntimeError> {
        let (_, payload) = self.inner.registry.snapshot(snapshot_id)?;
        let runtime = self
            .inner
            .provision(payload.config, Some(payload.archive), Some(snapshot_id))
            .await?;
        info!("restored snapshot {snapshot_id} into {}", runtime.id);
        Ok(runtime)
    }

    async fn list_snapshots(&self, runtime_id: Option<&str>) -> Result<Vec<Snapshot>, RuntimeError> {
        Ok(self.inner.registry.list_snapshots(runtime_id))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), RuntimeError> {
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
