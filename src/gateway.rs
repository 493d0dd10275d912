//! Top-level gateway: owns every component and their background tasks.
//!
//! Construct one [`Gateway`] per process, `start()` it, and pass it by
//! reference to consumers. `stop()` shuts the scheduler down with a
//! bounded wait and halts health probing. There is no global state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::endpoint::{EndpointProbe, EndpointRegistry, EndpointSnapshot};
use crate::error::Result;
use crate::event::{EventBus, Notification};
use crate::health::HealthMonitor;
use crate::limiter::RateLimiter;
use crate::pool::{ConnectionHandle, ConnectionPool};
use crate::scheduler::RequestScheduler;

/// Point-in-time view of the layer, for status endpoints and operator
/// tooling.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Handle count relative to the configured pool size.
    pub pool_utilization: f64,
    pub endpoints: Vec<EndpointSnapshot>,
    /// Operations currently executing.
    pub active_requests: usize,
    pub strategy: String,
}

/// Aggregate counters since startup.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub submitted: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub rejected: u64,
    pub queued: usize,
    pub probe_rounds: u64,
    pub handles_created: u64,
    pub handles_evicted: u64,
    pub leases: u64,
    pub endpoint_unavailable: u64,
}

/// Resilient connection layer over a set of remote ledger-query endpoints.
pub struct Gateway {
    registry: Arc<EndpointRegistry>,
    monitor: Arc<HealthMonitor>,
    pool: Arc<ConnectionPool>,
    limiter: Arc<RateLimiter>,
    scheduler: RequestScheduler,
    events: EventBus,
    health_loop: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
    default_max_retries: u32,
}

impl Gateway {
    /// Wire the layer from configuration. Fails on invalid configuration;
    /// no background work starts until [`start`](Self::start).
    pub fn new(config: Config, probe: Arc<dyn EndpointProbe>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let registry = Arc::new(EndpointRegistry::from_config(&config.endpoints));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            probe.clone(),
            config.health.clone(),
            events.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            registry.clone(),
            monitor.clone(),
            probe,
            config.pool.clone(),
            config.health.clone(),
            events.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.limiter.clone(), events.clone()));
        let scheduler = RequestScheduler::new(config.scheduler.clone(), limiter.clone());

        Ok(Self {
            registry,
            monitor,
            pool,
            limiter,
            scheduler,
            events,
            health_loop: Mutex::new(None),
            started_at: Mutex::new(None),
            running: AtomicBool::new(false),
            default_max_retries: config.scheduler.max_retries,
        })
    }

    /// Run the immediate probe round, fill the pool, and spawn the health
    /// and drain loops. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock() = Some(Utc::now());

        self.monitor.probe_all().await;
        self.pool.fill().await;
        self.scheduler.start();

        let monitor = self.monitor.clone();
        let pool = self.pool.clone();
        let interval = self.monitor.settings().check_interval();
        *self.health_loop.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate round already ran; skip the first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.probe_all().await;
                pool.maintain().await;
            }
        }));

        info!(
            endpoints = self.registry.len(),
            healthy = self.registry.healthy_count(),
            handles = self.pool.len(),
            "Gateway started"
        );
        self.events.emit(Notification::Started);
    }

    /// Stop admitting work, wait (bounded) for in-flight operations, and
    /// halt health probing. Queued-but-unstarted requests are discarded:
    /// their futures reject with [`crate::Error::Shutdown`].
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.events.emit(Notification::Stopped);
        self.scheduler.shutdown().await;
        if let Some(handle) = self.health_loop.lock().take() {
            handle.abort();
        }
        info!("Gateway stopped");
    }

    /// Submit an operation with an explicit priority and retry budget.
    /// See [`RequestScheduler::submit`].
    pub fn submit<T, F, Fut>(
        &self,
        scope: impl Into<String>,
        priority: i32,
        max_retries: u32,
        op: F,
    ) -> impl Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.scheduler.submit(scope, priority, max_retries, op)
    }

    /// Submit with the configured default retry budget.
    pub fn submit_default<T, F, Fut>(
        &self,
        scope: impl Into<String>,
        priority: i32,
        op: F,
    ) -> impl Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.scheduler
            .submit(scope, priority, self.default_max_retries, op)
    }

    /// Select a connection handle. See [`ConnectionPool::get_connection`].
    pub fn get_connection(&self) -> Result<Arc<ConnectionHandle>> {
        self.pool.get_connection()
    }

    /// Return a lease to the pool.
    pub fn release(&self, handle: &ConnectionHandle) {
        self.pool.release(handle);
    }

    pub async fn scale_up(&self, n: usize) -> usize {
        self.pool.scale_up(n).await
    }

    pub fn scale_down(&self, remaining: usize) {
        self.pool.scale_down(remaining);
    }

    /// Tune scheduler admission at runtime.
    pub fn set_rate_limit(&self, max_concurrent: usize, spacing: Duration) {
        self.scheduler.set_rate_limit(max_concurrent, spacing);
    }

    /// Tighten every rate-limit scope (external congestion signal).
    pub fn increase_delay(&self, pct: f64) {
        self.limiter.increase_delay(pct);
    }

    /// Relax every rate-limit scope.
    pub fn decrease_delay(&self, pct: f64) {
        self.limiter.decrease_delay(pct);
    }

    /// Shared pool reference, for operations that route their own remote
    /// calls through a handle.
    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// Subscribe to lifecycle and throttling notifications.
    pub fn events(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            pool_utilization: self.pool.utilization(),
            endpoints: self.registry.snapshots(),
            active_requests: self.scheduler.active_count(),
            strategy: self.pool.strategy().to_string(),
        }
    }

    pub fn stats(&self) -> GatewayStats {
        let sched = self.scheduler.counters();
        let pool = self.pool.counters();
        GatewayStats {
            started_at: *self.started_at.lock(),
            submitted: sched.submitted.load(Ordering::Relaxed),
            succeeded: sched.succeeded.load(Ordering::Relaxed),
            retried: sched.retried.load(Ordering::Relaxed),
            rejected: sched.rejected.load(Ordering::Relaxed),
            queued: self.scheduler.queue_len(),
            probe_rounds: self.monitor.rounds(),
            handles_created: pool.handles_created.load(Ordering::Relaxed),
            handles_evicted: pool.handles_evicted.load(Ordering::Relaxed),
            leases: pool.leases.load(Ordering::Relaxed),
            endpoint_unavailable: pool.unavailable.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(handle) = self.health_loop.lock().take() {
            handle.abort();
        }
    }
}
