//! Periodic endpoint health probing.
//!
//! One probe round issues a cheap canary call to every configured endpoint
//! concurrently, each raced against the connection timeout. Outcomes feed
//! the registry's error/success counters; health flips strictly by the
//! error-rate threshold. Failures are independent per endpoint: one
//! endpoint's outcome never affects another's computation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::HealthSettings;
use crate::endpoint::{Endpoint, EndpointProbe, EndpointRegistry, Health};
use crate::event::{EventBus, Notification};

/// Runs probe rounds against the registry.
///
/// The monitor itself is passive; the gateway drives it on a fixed
/// interval (one immediate round at startup, then every
/// `check_interval`). [`probe_all`](Self::probe_all) is also invoked
/// directly by the pool's best-effort recovery path.
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    probe: Arc<dyn EndpointProbe>,
    settings: HealthSettings,
    events: EventBus,
    rounds: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        probe: Arc<dyn EndpointProbe>,
        settings: HealthSettings,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            probe,
            settings,
            events,
            rounds: AtomicU64::new(0),
        }
    }

    /// Run one probe round over every endpoint, healthy or not.
    ///
    /// Unhealthy endpoints are re-probed every cycle so they can recover.
    pub async fn probe_all(&self) {
        let probes = self
            .registry
            .all()
            .iter()
            .map(|endpoint| self.probe_one(endpoint.clone()));
        join_all(probes).await;

        self.rounds.fetch_add(1, Ordering::Relaxed);
        let total = self.registry.len();
        let healthy = self.registry.healthy_count();
        debug!(total, healthy, "Health check round complete");
        self.events.emit(Notification::HealthCheckComplete {
            total_endpoints: total,
            healthy_endpoints: healthy,
        });
    }

    /// Probe one endpoint: canary call raced against the timeout. A
    /// timeout counts as a failure like any other.
    async fn probe_one(&self, endpoint: Arc<Endpoint>) {
        let before = endpoint.health();
        let started = Instant::now();
        let outcome = timeout(
            self.settings.connection_timeout(),
            self.probe.check(endpoint.url()),
        )
        .await;

        let after = match outcome {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                endpoint.record_probe_success(latency, self.settings.max_error_rate)
            }
            Ok(Err(err)) => {
                warn!(endpoint = %endpoint.id(), error = %err, "Probe failed");
                endpoint.record_probe_failure(self.settings.max_error_rate)
            }
            Err(_) => {
                warn!(
                    endpoint = %endpoint.id(),
                    timeout_ms = self.settings.connection_timeout_ms,
                    "Probe timed out"
                );
                endpoint.record_probe_failure(self.settings.max_error_rate)
            }
        };

        if before != after {
            info!(
                endpoint = %endpoint.id(),
                healthy = (after == Health::Healthy),
                "Endpoint health changed"
            );
        }
    }

    /// Total completed probe rounds.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }
}
