use crate::error::ResourceType;
use crate::events::RuntimeEvent;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Usage above this fraction of a limit raises a `resourceWarning`.
pub const RESOURCE_WARNING_RATIO: f64 = 0.9;

/// One pass over every runtime a provider owns.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe_all(&self);
}

/// Periodic background health checking, owned by a provider instance.
///
/// The task runs until [`HealthMonitor::stop`] is called or the monitor is
/// dropped.
pub struct HealthMonitor {
    interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the loop on the current tokio runtime. A second call while the
    /// loop is running is a no-op.
    pub fn start(&self, probe: Arc<dyn HealthProbe>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => probe.probe_all().await,
                }
            }
            debug!("health monitor stopped");
        });
        debug!("health monitor started, interval {interval:?}");
        *task = Some((token, handle));
    }

    pub fn stop(&self) {
        if let Some((token, handle)) = self.task.lock().take() {
            token.cancel();
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build a `resourceWarning` event when `usage` crosses the warning ratio of
/// `limit`. A zero limit never warns.
pub fn resource_warning(
    runtime_id: &str,
    resource_type: ResourceType,
    usage: f64,
    limit: f64,
) -> Option<RuntimeEvent> {
    if limit <= 0.0 || usage < limit * RESOURCE_WARNING_RATIO {
        return None;
    }
    Some(RuntimeEvent::ResourceWarning {
        runtime_id: runtime_id.to_owned(),
        timestamp: Utc::now(),
        resource_type,
        usage,
        limit,
    })
}
