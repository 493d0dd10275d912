//! Load-balancing connection pool.
//!
//! The pool owns a bounded set of [`ConnectionHandle`]s, each bound to one
//! endpoint from the registry. Selection filters handles down to those on
//! healthy, not-soft-rate-limited endpoints and applies the configured
//! strategy. A maintenance pass after every health round prunes handles on
//! endpoints that went unhealthy and tops the pool back up to its floor.
//!
//! When the eligible set is empty, `get_connection` fails fast with
//! [`Error::EndpointUnavailable`] and spawns a detached best-effort
//! recovery task (one forced probe round, then one new handle on any
//! now-healthy endpoint) that never blocks the failing call.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{HealthSettings, LoadBalanceStrategy, PoolSettings};
use crate::endpoint::{Endpoint, EndpointProbe, EndpointRegistry};
use crate::error::{Error, Result};
use crate::event::{EventBus, Notification};
use crate::health::HealthMonitor;

mod manage;
mod select;


use manage::{create_handle, spawn_recovery, RecoveryContext};

/// Length of the per-endpoint rolling request window used for soft rate
/// exclusion.
pub(crate) const SOFT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// A pool-managed lease bound to one endpoint.
///
/// Handles are owned exclusively by the pool; callers receive `Arc`
/// leases. A handle never outlives its endpoint's pool membership; the
/// maintenance pass drops every handle whose endpoint went unhealthy.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    endpoint: Arc<Endpoint>,
    active_requests: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl ConnectionHandle {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            active_requests: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The endpoint this handle is bound to.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Number of in-flight requests routed through this handle.
    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    fn mark_leased(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Instant::now();
    }

    fn mark_released(&self) {
        // Floor at zero; a double release must not underflow.
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// Aggregate pool counters for observability.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) handles_created: AtomicU64,
    pub(crate) handles_evicted: AtomicU64,
    pub(crate) leases: AtomicU64,
    pub(crate) unavailable: AtomicU64,
}

/// Load-balancing pool of connection handles over the endpoint registry.
pub struct ConnectionPool {
    registry: Arc<EndpointRegistry>,
    monitor: Arc<HealthMonitor>,
    probe: Arc<dyn EndpointProbe>,
    settings: PoolSettings,
    health: HealthSettings,
    handles: Arc<Mutex<Vec<Arc<ConnectionHandle>>>>,
    rr_cursor: AtomicUsize,
    recovering: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    events: EventBus,
}

impl ConnectionPool {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        monitor: Arc<HealthMonitor>,
        probe: Arc<dyn EndpointProbe>,
        settings: PoolSettings,
        health: HealthSettings,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            monitor,
            probe,
            settings,
            health,
            handles: Arc::new(Mutex::new(Vec::new())),
            rr_cursor: AtomicUsize::new(0),
            recovering: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PoolCounters::default()),
            events,
        }
    }

    /// Fill the pool to its target size. Called once at startup, after the
    /// initial probe round has marked endpoints healthy.
    pub async fn fill(&self) -> usize {
        self.scale_up(self.settings.size).await
    }

    /// Select a connection handle for one operation.
    ///
    /// Eligible handles are those on healthy endpoints that have not
    /// crossed their soft rate buffer. An empty eligible set fails fast
    /// and triggers background recovery.
    pub fn get_connection(&self) -> Result<Arc<ConnectionHandle>> {
        let eligible: Vec<Arc<ConnectionHandle>> = {
            let handles = self.handles.lock();
            handles
                .iter()
                .filter(|h| {
                    h.endpoint().is_healthy()
                        && !h.endpoint().soft_limited(
                            SOFT_RATE_WINDOW,
                            self.settings.rate_limit_buffer,
                            self.settings.endpoint_requests_per_minute,
                        )
                })
                .cloned()
                .collect()
        };

        if eligible.is_empty() {
            self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
            warn!("No eligible connection handle, triggering recovery");
            spawn_recovery(self.recovery_context());
            return Err(Error::EndpointUnavailable);
        }

        let handle = select::pick(&eligible, self.settings.strategy, &self.rr_cursor).clone();
        handle.mark_leased();
        self.counters.leases.fetch_add(1, Ordering::Relaxed);

        let endpoint = handle.endpoint();
        endpoint.note_request(SOFT_RATE_WINDOW);
        let (usage, crossed) = endpoint.soft_usage(
            SOFT_RATE_WINDOW,
            self.settings.rate_limit_buffer,
            self.settings.endpoint_requests_per_minute,
        );
        if crossed {
            warn!(endpoint = %endpoint.id(), usage, "Endpoint crossed soft rate buffer");
            self.events.emit(Notification::RateLimitWarning {
                endpoint: endpoint.id().to_string(),
                usage,
            });
        }

        Ok(handle)
    }

    /// Return a lease. Decrements the handle's in-flight count, floored
    /// at zero.
    pub fn release(&self, handle: &ConnectionHandle) {
        handle.mark_released();
    }

    /// Create `n` new handles distributed round-robin across currently
    /// healthy endpoints. Creation is best-effort: a dial failure on one
    /// endpoint never aborts creation on the others. Returns the number
    /// of handles actually created.
    pub async fn scale_up(&self, n: usize) -> usize {
        let previous = self.handles.lock().len();
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            warn!(requested = n, "Cannot scale up: no healthy endpoint");
            return 0;
        }

        let mut created = Vec::with_capacity(n);
        for i in 0..n {
            let endpoint = &healthy[i % healthy.len()];
            match create_handle(
                self.probe.as_ref(),
                endpoint,
                self.health.connection_timeout(),
            )
            .await
            {
                Ok(handle) => created.push(handle),
                Err(err) => {
                    warn!(endpoint = %endpoint.id(), error = %err, "Handle creation failed");
                }
            }
        }

        let current = {
            let mut handles = self.handles.lock();
            handles.extend(created.iter().cloned());
            handles.len()
        };
        self.counters
            .handles_created
            .fetch_add(created.len() as u64, Ordering::Relaxed);
        info!(previous, current, "Pool scaled up");
        self.events.emit(Notification::ScaledUp {
            previous_size: previous,
            current_size: current,
        });
        created.len()
    }

    /// Evict least-recently-used handles until exactly `remaining` are
    /// left. The `remaining` handles with the largest last-used instants
    /// survive.
    pub fn scale_down(&self, remaining: usize) {
        let (previous, current) = {
            let mut handles = self.handles.lock();
            let previous = handles.len();
            if previous > remaining {
                handles.sort_by_key(|h| h.last_used());
                let evicted = previous - remaining;
                handles.drain(..evicted);
                self.counters
                    .handles_evicted
                    .fetch_add(evicted as u64, Ordering::Relaxed);
            }
            (previous, handles.len())
        };

        if previous != current {
            info!(previous, current, "Pool scaled down");
            self.events.emit(Notification::ScaledDown {
                previous_size: previous,
                current_size: current,
            });
        }
    }

    /// Maintenance pass, run after every health round: drop handles whose
    /// endpoint went unhealthy, then top the pool back up to its floor if
    /// any healthy endpoint exists.
    pub async fn maintain(&self) {
        let (pruned, len) = {
            let mut handles = self.handles.lock();
            let before = handles.len();
            handles.retain(|h| h.endpoint().is_healthy());
            (before - handles.len(), handles.len())
        };
        if pruned > 0 {
            self.counters
                .handles_evicted
                .fetch_add(pruned as u64, Ordering::Relaxed);
            info!(pruned, remaining = len, "Pruned handles on unhealthy endpoints");
        }

        let floor = self.settings.floor();
        if len < floor && self.registry.healthy_count() > 0 {
            let missing = floor - len;
            debug!(missing, floor, "Topping pool up to floor");
            self.scale_up(missing).await;
        }
    }

    /// Current handle count.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Handle count relative to the configured target size.
    pub fn utilization(&self) -> f64 {
        if self.settings.size == 0 {
            return 0.0;
        }
        self.len() as f64 / self.settings.size as f64
    }

    /// Total in-flight requests across all handles.
    pub fn active_requests(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .map(|h| h.active_requests())
            .sum()
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.settings.strategy
    }

    pub(crate) fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    fn recovery_context(&self) -> RecoveryContext {
        RecoveryContext {
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
            probe: self.probe.clone(),
            handles: self.handles.clone(),
            counters: self.counters.clone(),
            recovering: self.recovering.clone(),
            dial_timeout: self.health.connection_timeout(),
        }
    }

    #[cfg(test)]
    pub(crate) fn handle_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.handles.lock().clone()
    }
}
