//! Handle creation and best-effort recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::endpoint::{Endpoint, EndpointProbe, EndpointRegistry};
use crate::error::{Error, Result};
use crate::health::HealthMonitor;

use super::{ConnectionHandle, PoolCounters};

/// Everything the detached recovery task needs, cloned out of the pool so
/// the task never borrows it.
pub(super) struct RecoveryContext {
    pub(super) registry: Arc<EndpointRegistry>,
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) probe: Arc<dyn EndpointProbe>,
    pub(super) handles: Arc<Mutex<Vec<Arc<ConnectionHandle>>>>,
    pub(super) counters: Arc<PoolCounters>,
    pub(super) recovering: Arc<AtomicBool>,
    pub(super) dial_timeout: Duration,
}

/// Dial an endpoint and wrap it in a new handle on success.
pub(super) async fn create_handle(
    probe: &dyn EndpointProbe,
    endpoint: &Arc<Endpoint>,
    dial_timeout: Duration,
) -> Result<Arc<ConnectionHandle>> {
    match timeout(dial_timeout, probe.check(endpoint.url())).await {
        Ok(Ok(())) => Ok(Arc::new(ConnectionHandle::new(endpoint.clone()))),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::timeout(format!(
            "dial to {} exceeded {}ms",
            endpoint.id(),
            dial_timeout.as_millis()
        ))),
    }
}

/// Spawn the best-effort recovery task: force one probe round, then try to
/// create a single handle on any now-healthy endpoint. Runs detached so
/// the failing `get_connection` call returns immediately; only one
/// recovery runs at a time.
pub(super) fn spawn_recovery(ctx: RecoveryContext) {
    if ctx.recovering.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async move {
        ctx.monitor.probe_all().await;

        let healthy = ctx.registry.list_healthy();
        if healthy.is_empty() {
            warn!("Recovery probe round found no healthy endpoint");
            ctx.recovering.store(false, Ordering::SeqCst);
            return;
        }

        for endpoint in &healthy {
            match create_handle(ctx.probe.as_ref(), endpoint, ctx.dial_timeout).await {
                Ok(handle) => {
                    info!(endpoint = %endpoint.id(), "Recovery created a handle");
                    ctx.handles.lock().push(handle);
                    ctx.counters.handles_created.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.id(), error = %err, "Recovery dial failed");
                }
            }
        }

        ctx.recovering.store(false, Ordering::SeqCst);
    });
}
