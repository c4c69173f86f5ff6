use crate::error::ResourceType;
use crate::events::{EventBus, RuntimeEvent};
use crate::lifecycle::validate_transition;
use crate::types::{
    AgentRuntime, ResourceRequest, ResourceUsage, RuntimeFilter, RuntimeKind, RuntimeMetadata,
    RuntimeState, Snapshot,
};
use crate::RuntimeError;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

static RUNTIME_SEQ: AtomicU64 = AtomicU64::new(1);
static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Allocate a runtime id of the form `<kind>-<seq>-<unix millis>`.
///
/// The sequence is process-wide, so ids never repeat within a process even
/// when providers are dropped and recreated.
pub fn next_runtime_id(kind: RuntimeKind) -> String {
    let seq = RUNTIME_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{kind}-{seq}-{}", Utc::now().timestamp_millis())
}

pub fn next_snapshot_id() -> String {
    let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("snap-{seq}-{}", Utc::now().timestamp_millis())
}

/// Aggregate ceiling on requested resources across live runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    #[serde(default)]
    pub max_cpu_cores: Option<f64>,
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

#[derive(Debug, Default)]
struct Reservations {
    slots: usize,
    cpu: f64,
    memory: u64,
}

/// In-process admission control. Checks run before any substrate call.
#[derive(Debug)]
pub struct Admission {
    max_runtimes: Option<usize>,
    quota: ResourceQuota,
    reserved: Arc<Mutex<Reservations>>,
}

impl Admission {
    pub fn new(max_runtimes: Option<usize>, quota: Option<ResourceQuota>) -> Self {
        Self {
            max_runtimes,
            quota: quota.unwrap_or_default(),
            reserved: Arc::new(Mutex::new(Reservations::default())),
        }
    }

    /// Reserve a slot and the requested resources. The reservation is held by
    /// the returned permit and released when it is dropped.
    pub fn admit(&self, request: &ResourceRequest) -> Result<AdmissionPermit, RuntimeError> {
        let mut reserved = self.reserved.lock();

        if let Some(max) = self.max_runtimes {
            if reserved.slots >= max {
                return Err(RuntimeError::resource_exhausted(
                    ResourceType::Agents,
                    format!("runtime ceiling of {max} reached"),
                )
                .with_context("max_runtimes", max)
                .with_context("active", reserved.slots));
            }
        }
        if let Some(max_cpu) = self.quota.max_cpu_cores {
            if reserved.cpu + request.cpu > max_cpu {
                return Err(RuntimeError::resource_exhausted(
                    ResourceType::Cpu,
                    format!(
                        "requested {} cores exceeds remaining quota ({} of {max_cpu} in use)",
                        request.cpu, reserved.cpu
                    ),
                )
                .with_context("requested_cpu", request.cpu));
            }
        }
        if let Some(max_memory) = self.quota.max_memory_bytes {
            if reserved.memory.saturating_add(request.memory) > max_memory {
                return Err(RuntimeError::resource_exhausted(
                    ResourceType::Memory,
                    format!(
                        "requested {} bytes exceeds remaining quota ({} of {max_memory} in use)",
                        request.memory, reserved.memory
                    ),
                )
                .with_context("requested_memory", request.memory));
            }
        }

        reserved.slots += 1;
        reserved.cpu += request.cpu;
        reserved.memory = reserved.memory.saturating_add(request.memory);

        Ok(AdmissionPermit {
            reserved: Arc::clone(&self.reserved),
            cpu: request.cpu,
            memory: request.memory,
        })
    }

    pub fn in_use(&self) -> usize {
        self.reserved.lock().slots
    }
}

#[derive(Debug)]
pub struct AdmissionPermit {
    reserved: Arc<Mutex<Reservations>>,
    cpu: f64,
    memory: u64,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock();
        reserved.slots = reserved.slots.saturating_sub(1);
        reserved.cpu = (reserved.cpu - self.cpu).max(0.0);
        reserved.memory = reserved.memory.saturating_sub(self.memory);
    }
}

struct Entry<H> {
    runtime: AgentRuntime,
    handle: H,
    state_tx: watch::Sender<RuntimeState>,
    _permit: Option<AdmissionPermit>,
}

struct SnapshotEntry<S> {
    snapshot: Snapshot,
    payload: S,
}

/// Provider-owned bookkeeping of live runtimes and snapshots.
///
/// `H` is the backend handle stored next to each runtime (pod name, worktree
/// path); `S` is the backend payload stored next to each snapshot. All state
/// transitions go through [`RuntimeRegistry::transition`], which validates
/// them and emits `stateChange` events after releasing the lock.
pub struct RuntimeRegistry<H, S> {
    kind: RuntimeKind,
    runtimes: RwLock<HashMap<String, Entry<H>>>,
    /// Tombstones of terminated runtimes. Ids are never reused, so this grows
    /// for the life of the provider by design.
    terminated: RwLock<HashSet<String>>,
    snapshots: RwLock<HashMap<String, SnapshotEntry<S>>>,
    events: EventBus,
}

impl<H: Clone + Send + Sync, S: Clone + Send + Sync> RuntimeRegistry<H, S> {
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            runtimes: RwLock::new(HashMap::new()),
            terminated: RwLock::new(HashSet::new()),
            snapshots: RwLock::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Record a new runtime in `pending`. No event is emitted for creation
    /// itself; the first event is `pending -> creating`.
    pub fn insert_pending(
        &self,
        id: &str,
        handle: H,
        metadata: RuntimeMetadata,
        permit: Option<AdmissionPermit>,
    ) -> AgentRuntime {
        let now = Utc::now();
        let runtime = AgentRuntime {
            id: id.to_owned(),
            runtime_type: self.kind,
            state: RuntimeState::Pending,
            resources: ResourceUsage::default(),
            created_at: now,
            last_active_at: now,
            metadata,
        };
        let (state_tx, _) = watch::channel(RuntimeState::Pending);
        self.runtimes.write().insert(
            id.to_owned(),
            Entry {
                runtime: runtime.clone(),
                handle,
                state_tx,
                _permit: permit,
            },
        );
        runtime
    }

    /// Validate and apply a state transition, then emit `stateChange`.
    pub fn transition(&self, id: &str, to: RuntimeState) -> Result<RuntimeState, RuntimeError> {
        let previous = {
            let mut runtimes = self.runtimes.write();
            let entry = runtimes
                .get_mut(id)
                .ok_or_else(|| RuntimeError::runtime_not_found(id))?;
            let previous = entry.runtime.state;
            validate_transition(previous, to).map_err(|e| e.with_runtime(id))?;
            entry.runtime.state = to;
            entry.state_tx.send_replace(to);
            previous
        };
        debug!("{id}: {previous} -> {to}");
        self.events
            .emit(&RuntimeEvent::state_change(id, previous, to));
        Ok(previous)
    }

    /// Move a runtime to `error` and emit both `stateChange` and `error`.
    pub fn fail(&self, id: &str, err: &RuntimeError) -> Result<(), RuntimeError> {
        self.transition(id, RuntimeState::Error)?;
        self.events.emit(&RuntimeEvent::error(id, err));
        Ok(())
    }

    /// Drop a record that never became usable (failed spawn). Its id is not
    /// tombstoned; to callers it never existed.
    pub fn discard(&self, id: &str) -> Option<H> {
        self.runtimes.write().remove(id).map(|e| e.handle)
    }

    /// Finish termination: transition to `terminated`, release the admission
    /// permit, and keep only a tombstone.
    pub fn finish_termination(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(id, RuntimeState::Terminated)?;
        self.terminated.write().insert(id.to_owned());
        self.runtimes.write().remove(id);
        Ok(())
    }

    pub fn is_terminated(&self, id: &str) -> bool {
        self.terminated.read().contains(id)
    }

    pub fn get(&self, id: &str) -> Result<AgentRuntime, RuntimeError> {
        self.runtimes
            .read()
            .get(id)
            .map(|e| e.runtime.clone())
            .ok_or_else(|| RuntimeError::runtime_not_found(id))
    }

    pub fn entry(&self, id: &str) -> Result<(AgentRuntime, H), RuntimeError> {
        self.runtimes
            .read()
            .get(id)
            .map(|e| (e.runtime.clone(), e.handle.clone()))
            .ok_or_else(|| RuntimeError::runtime_not_found(id))
    }

    /// Look up a runtime that must be `running` for the requested operation,
    /// and mark it active.
    pub fn running(&self, id: &str) -> Result<(AgentRuntime, H), RuntimeError> {
        let mut runtimes = self.runtimes.write();
        let entry = runtimes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::runtime_not_found(id))?;
        if entry.runtime.state != RuntimeState::Running {
            return Err(RuntimeError::execution(
                format!("runtime is {}, not running", entry.runtime.state),
                None,
            )
            .with_runtime(id)
            .with_context("state", entry.runtime.state));
        }
        entry.runtime.last_active_at = Utc::now();
        Ok((entry.runtime.clone(), entry.handle.clone()))
    }

    pub fn update_handle(&self, id: &str, handle: H) -> Result<(), RuntimeError> {
        let mut runtimes = self.runtimes.write();
        let entry = runtimes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::runtime_not_found(id))?;
        entry.handle = handle;
        Ok(())
    }

    pub fn update_metadata(
        &self,
        id: &str,
        update: impl FnOnce(&mut RuntimeMetadata),
    ) -> Result<(), RuntimeError> {
        let mut runtimes = self.runtimes.write();
        let entry = runtimes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::runtime_not_found(id))?;
        update(&mut entry.runtime.metadata);
        Ok(())
    }

    pub fn update_resources(&self, id: &str, usage: ResourceUsage) -> Result<(), RuntimeError> {
        let mut runtimes = self.runtimes.write();
        let entry = runtimes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::runtime_not_found(id))?;
        entry.runtime.resources = usage;
        Ok(())
    }

    pub fn list(&self, filter: Option<&RuntimeFilter>) -> Vec<AgentRuntime> {
        let mut list: Vec<AgentRuntime> = self
            .runtimes
            .read()
            .values()
            .map(|e| e.runtime.clone())
            .filter(|r| r.state != RuntimeState::Terminated)
            .filter(|r| filter.is_none_or(|f| f.matches(r)))
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn live(&self) -> Vec<(AgentRuntime, H)> {
        self.runtimes
            .read()
            .values()
            .map(|e| (e.runtime.clone(), e.handle.clone()))
            .collect()
    }

    /// Wait for `id` to reach `state` without side effects.
    pub async fn wait_for_state(
        &self,
        id: &str,
        state: RuntimeState,
        timeout: Duration,
    ) -> Result<bool, RuntimeError> {
        let rx = self.runtimes.read().get(id).map(|e| e.state_tx.subscribe());
        let Some(mut rx) = rx else {
            if self.is_terminated(id) {
                return Ok(state == RuntimeState::Terminated);
            }
            return Err(RuntimeError::runtime_not_found(id));
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => Ok(true),
            // Sender dropped: the record was removed.
            Ok(Err(_)) => Ok(state == RuntimeState::Terminated && self.is_terminated(id)),
            Err(_) => Ok(false),
        };
        result
    }

    // --- Snapshots ---

    pub fn insert_snapshot(&self, snapshot: Snapshot, payload: S) {
        self.snapshots.write().insert(
            snapshot.id.clone(),
            SnapshotEntry { snapshot, payload },
        );
    }

    pub fn snapshot(&self, id: &str) -> Result<(Snapshot, S), RuntimeError> {
        self.snapshots
            .read()
            .get(id)
            .map(|e| (e.snapshot.clone(), e.payload.clone()))
            .ok_or_else(|| RuntimeError::snapshot_not_found(id))
    }

    pub fn list_snapshots(&self, runtime_id: Option<&str>) -> Vec<Snapshot> {
        let mut list: Vec<Snapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|e| runtime_id.is_none_or(|id| e.snapshot.runtime_id == id))
            .map(|e| e.snapshot.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn remove_snapshot(&self, id: &str) -> Result<(Snapshot, S), RuntimeError> {
        self.snapshots
            .write()
            .remove(id)
            .map(|e| (e.snapshot, e.payload))
            .ok_or_else(|| RuntimeError::snapshot_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::ErrorCode;

    fn registry() -> RuntimeRegistry<String, ()> {
        RuntimeRegistry::new(RuntimeKind::Worktree)
    }

    fn spawn_running(reg: &RuntimeRegistry<String, ()>) -> String {
        let id = next_runtime_id(RuntimeKind::Worktree);
        reg.insert_pending(&id, "h".to_owned(), RuntimeMetadata::default(), None);
        reg.transition(&id, RuntimeState::Creating).unwrap();
        reg.transition(&id, RuntimeState::Running).unwrap();
        id
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let ids: HashSet<String> = (0..500)
            .map(|_| next_runtime_id(RuntimeKind::Kata))
            .collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| id.starts_with("kata-")));
        assert!(next_snapshot_id().starts_with("snap-"));
    }

    #[test]
    fn admission_ceiling_and_release() {
        let admission = Admission::new(Some(2), None);
        let request = ResourceRequest::default();
        let p1 = admission.admit(&request).unwrap();
        let _p2 = admission.admit(&request).unwrap();
        let err = admission.admit(&request).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        drop(p1);
        assert!(admission.admit(&request).is_ok());
    }

    #[test]
    fn admission_quota_rejects_by_resource() {
        let admission = Admission::new(
            None,
            Some(ResourceQuota {
                max_cpu_cores: Some(1.0),
                max_memory_bytes: Some(1024),
            }),
        );
        let small = ResourceRequest {
            cpu: 0.5,
            memory: 512,
            disk: None,
            max_agents: None,
        };
        let _a = admission.admit(&small).unwrap();
        let big_cpu = ResourceRequest { cpu: 0.75, ..small };
        match admission.admit(&big_cpu).unwrap_err() {
            RuntimeError::ResourceExhausted { resource_type, .. } => {
                assert_eq!(resource_type, ResourceType::Cpu);
            }
            other => panic!("unexpected {other:?}"),
        }
        let big_mem = ResourceRequest {
            memory: 1000,
            ..small
        };
        match admission.admit(&big_mem).unwrap_err() {
            RuntimeError::ResourceExhausted { resource_type, .. } => {
                assert_eq!(resource_type, ResourceType::Memory);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transitions_emit_events_in_order() {
        let reg = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        reg.events().subscribe(
            Some(EventKind::StateChange),
            Arc::new(move |e| {
                if let RuntimeEvent::StateChange {
                    previous_state,
                    current_state,
                    ..
                } = e
                {
                    s.lock().push((*previous_state, *current_state));
                }
            }),
        );
        let id = spawn_running(&reg);
        reg.transition(&id, RuntimeState::Terminating).unwrap();
        reg.finish_termination(&id).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (RuntimeState::Pending, RuntimeState::Creating),
                (RuntimeState::Creating, RuntimeState::Running),
                (RuntimeState::Running, RuntimeState::Terminating),
                (RuntimeState::Terminating, RuntimeState::Terminated),
            ]
        );
    }

    #[test]
    fn terminated_runtime_is_not_found_but_tombstoned() {
        let reg = registry();
        let id = spawn_running(&reg);
        reg.transition(&id, RuntimeState::Terminating).unwrap();
        reg.finish_termination(&id).unwrap();

        assert!(reg.get(&id).unwrap_err().is_not_found());
        assert!(reg.running(&id).unwrap_err().is_not_found());
        assert!(reg.is_terminated(&id));
        assert!(reg.list(None).is_empty());
    }

    #[test]
    fn running_rejects_non_running_state() {
        let reg = registry();
        let id = next_runtime_id(RuntimeKind::Worktree);
        reg.insert_pending(&id, "h".to_owned(), RuntimeMetadata::default(), None);
        let err = reg.running(&id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionError);
    }

    #[test]
    fn discarded_record_releases_permit() {
        let reg = registry();
        let admission = Admission::new(Some(1), None);
        let permit = admission.admit(&ResourceRequest::default()).unwrap();
        let id = next_runtime_id(RuntimeKind::Worktree);
        reg.insert_pending(&id, "h".to_owned(), RuntimeMetadata::default(), Some(permit));
        assert_eq!(admission.in_use(), 1);
        reg.discard(&id);
        assert_eq!(admission.in_use(), 0);
        assert!(!reg.is_terminated(&id));
    }

    #[tokio::test]
    async fn wait_for_state_resolves_and_times_out() {
        let reg = Arc::new(registry());
        let id = next_runtime_id(RuntimeKind::Worktree);
        reg.insert_pending(&id, "h".to_owned(), RuntimeMetadata::default(), None);

        let waiter = {
            let reg = Arc::clone(&reg);
            let id = id.clone();
            tokio::spawn(async move {
                reg.wait_for_state(&id, RuntimeState::Running, Duration::from_secs(5))
                    .await
            })
        };
        reg.transition(&id, RuntimeState::Creating).unwrap();
        reg.transition(&id, RuntimeState::Running).unwrap();
        assert!(waiter.await.unwrap().unwrap());

        let timed_out = reg
            .wait_for_state(&id, RuntimeState::Paused, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!timed_out);

        let err = reg
            .wait_for_state("worktree-0-0", RuntimeState::Running, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn wait_for_terminated_after_termination() {
        let reg = registry();
        let id = spawn_running(&reg);
        reg.transition(&id, RuntimeState::Terminating).unwrap();
        reg.finish_termination(&id).unwrap();
        assert!(reg
            .wait_for_state(&id, RuntimeState::Terminated, Duration::from_millis(5))
            .await
            .unwrap());
        assert!(!reg
            .wait_for_state(&id, RuntimeState::Running, Duration::from_millis(5))
            .await
            .unwrap());
    }

    #[test]
    fn snapshot_bookkeeping() {
        let reg: RuntimeRegistry<String, u32> = RuntimeRegistry::new(RuntimeKind::Kata);
        let snap = Snapshot {
            id: next_snapshot_id(),
            runtime_id: "kata-1-1".to_owned(),
            created_at: Utc::now(),
            size: 10,
            metadata: crate::types::SnapshotMetadata::default(),
        };
        reg.insert_snapshot(snap.clone(), 7);
        assert_eq!(reg.snapshot(&snap.id).unwrap().1, 7);
        assert_eq!(reg.list_snapshots(Some("kata-1-1")).len(), 1);
        assert!(reg.list_snapshots(Some("kata-2-2")).is_empty());
        reg.remove_snapshot(&snap.id).unwrap();
        assert!(reg.remove_snapshot(&snap.id).unwrap_err().is_not_found());
    }
}
