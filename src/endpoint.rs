//! Endpoint identity, health state, and the registry that owns both.
//!
//! An [`Endpoint`] is shared by reference between the registry and every
//! connection handle bound to it. The registry (fed by the health monitor)
//! is the sole mutator of health and latency fields; the pool only touches
//! the per-endpoint rolling request window used for soft rate exclusion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::config::EndpointConfig;
use crate::error::Result;

/// Identifier for a configured endpoint. Derived from the endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health state machine: `Unchecked → Healthy ⇄ Unhealthy`.
///
/// Transitions are decided solely by the error-rate threshold, recomputed
/// on every probe outcome. Unhealthy endpoints are never removed; they are
/// re-probed each cycle and may recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No probe has completed yet.
    Unchecked,
    Healthy,
    Unhealthy,
}

/// Mutable endpoint state, guarded by a single short-lived lock.
#[derive(Debug)]
struct EndpointState {
    health: Health,
    last_checked_at: Option<Instant>,
    /// Exponential moving average over probe latencies, weight 0.5 new /
    /// 0.5 old.
    rolling_latency: Option<Duration>,
    error_count: u64,
    success_count: u64,
    /// Rolling request window for soft rate exclusion.
    window_start: Instant,
    requests_in_window: u32,
    /// Set once per window when the soft buffer is crossed, so the
    /// warning fires once rather than per call.
    warned_this_window: bool,
}

/// One remote service address the pool may route work to.
///
/// Created at configuration time and never destroyed, only flipped
/// between healthy and unhealthy by probe outcomes.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    url: Url,
    priority: u32,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub(crate) fn new(config: &EndpointConfig) -> Self {
        Self {
            id: EndpointId::new(config.url.as_str()),
            url: config.url.clone(),
            priority: config.priority,
            state: Mutex::new(EndpointState {
                health: Health::Unchecked,
                last_checked_at: None,
                rolling_latency: None,
                error_count: 0,
                success_count: 0,
                window_start: Instant::now(),
                requests_in_window: 0,
                warned_this_window: false,
            }),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }

    /// Rolling probe-latency average, if at least one probe succeeded.
    pub fn rolling_latency(&self) -> Option<Duration> {
        self.state.lock().rolling_latency
    }

    /// Record a successful probe: fold the observed latency into the
    /// rolling average, bump the success count, and recompute health.
    pub(crate) fn record_probe_success(&self, latency: Duration, max_error_rate: f64) -> Health {
        let mut state = self.state.lock();
        state.rolling_latency = Some(match state.rolling_latency {
            Some(old) => (old + latency) / 2,
            None => latency,
        });
        state.success_count += 1;
        state.last_checked_at = Some(Instant::now());
        state.recompute_health(max_error_rate)
    }

    /// Record a failed or timed-out probe and recompute health.
    pub(crate) fn record_probe_failure(&self, max_error_rate: f64) -> Health {
        let mut state = self.state.lock();
        state.error_count += 1;
        state.last_checked_at = Some(Instant::now());
        state.recompute_health(max_error_rate)
    }

    /// Count one routed request against the rolling window.
    pub(crate) fn note_request(&self, window: Duration) {
        let mut state = self.state.lock();
        state.roll_window(window);
        state.requests_in_window += 1;
    }

    /// Rolling-window usage as a fraction of the assumed limit.
    ///
    /// Returns `(usage, crossed_buffer_now)`; the second element is true
    /// exactly once per window, when usage first reaches the buffer.
    pub(crate) fn soft_usage(
        &self,
        window: Duration,
        buffer: f64,
        assumed_limit: u32,
    ) -> (f64, bool) {
        let mut state = self.state.lock();
        state.roll_window(window);
        let usage = f64::from(state.requests_in_window) / f64::from(assumed_limit.max(1));
        let over = f64::from(state.requests_in_window) >= buffer * f64::from(assumed_limit);
        let crossed = over && !state.warned_this_window;
        if crossed {
            state.warned_this_window = true;
        }
        (usage, crossed)
    }

    /// Whether the endpoint is currently excluded by the soft rate buffer.
    pub(crate) fn soft_limited(&self, window: Duration, buffer: f64, assumed_limit: u32) -> bool {
        let mut state = self.state.lock();
        state.roll_window(window);
        f64::from(state.requests_in_window) >= buffer * f64::from(assumed_limit)
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> EndpointSnapshot {
        let state = self.state.lock();
        EndpointSnapshot {
            address: self.url.to_string(),
            healthy: state.health == Health::Healthy,
            latency_ms: state.rolling_latency.map(|d| d.as_millis() as u64),
            error_count: state.error_count,
            success_count: state.success_count,
        }
    }
}

impl EndpointState {
    /// Recompute health from the error ratio. The counters never decay:
    /// `errors / (errors + successes)` spans the whole process lifetime.
    fn recompute_health(&mut self, max_error_rate: f64) -> Health {
        let total = self.error_count + self.success_count;
        let ratio = if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        };
        self.health = if ratio <= max_error_rate {
            Health::Healthy
        } else {
            Health::Unhealthy
        };
        self.health
    }

    /// Reset the rolling window once it has fully elapsed.
    fn roll_window(&mut self, window: Duration) {
        if self.window_start.elapsed() >= window {
            self.window_start = Instant::now();
            self.requests_in_window = 0;
            self.warned_this_window = false;
        }
    }
}

/// Serializable endpoint view used by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub address: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub error_count: u64,
    pub success_count: u64,
}

/// Owns the configured endpoints in stable priority order.
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Build the registry from configuration. Endpoints keep their
    /// configured order within equal priorities.
    pub fn from_config(configs: &[EndpointConfig]) -> Self {
        let mut endpoints: Vec<Arc<Endpoint>> = configs
            .iter()
            .map(|c| Arc::new(Endpoint::new(c)))
            .collect();
        endpoints.sort_by_key(|e| e.priority());
        Self { endpoints }
    }

    pub fn all(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints currently marked healthy, in stable registry order.
    pub fn list_healthy(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.is_healthy())
            .cloned()
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    /// Snapshots for status reporting, in registry order.
    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }
}

/// Seam to the remote side: a cheap canary call against one endpoint.
///
/// The same call backs health probing and the best-effort dial performed
/// when the pool creates a new handle.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn check(&self, url: &Url) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint::new(&EndpointConfig {
            url: Url::parse(url).unwrap(),
            priority: 0,
        })
    }

    #[test]
    fn starts_unchecked() {
        let ep = endpoint("https://a.example.com");
        assert_eq!(ep.health(), Health::Unchecked);
        assert!(!ep.is_healthy());
    }

    #[test]
    fn health_tracks_error_ratio_exactly() {
        let ep = endpoint("https://a.example.com");
        // 1 failure / 1 total = 1.0 > 0.5
        ep.record_probe_failure(0.5);
        assert_eq!(ep.health(), Health::Unhealthy);
        // 1 failure / 2 total = 0.5 <= 0.5
        ep.record_probe_success(Duration::from_millis(10), 0.5);
        assert_eq!(ep.health(), Health::Healthy);
        // 2 failures / 3 total ≈ 0.67 > 0.5
        ep.record_probe_failure(0.5);
        assert_eq!(ep.health(), Health::Unhealthy);
    }

    #[test]
    fn one_failure_does_not_sink_a_long_success_history() {
        let ep = endpoint("https://a.example.com");
        for _ in 0..9 {
            ep.record_probe_success(Duration::from_millis(5), 0.3);
        }
        ep.record_probe_failure(0.3);
        // 1/10 = 0.1 <= 0.3
        assert_eq!(ep.health(), Health::Healthy);
    }

    #[test]
    fn latency_average_halves_toward_new_samples() {
        let ep = endpoint("https://a.example.com");
        ep.record_probe_success(Duration::from_millis(100), 0.5);
        assert_eq!(ep.rolling_latency(), Some(Duration::from_millis(100)));
        ep.record_probe_success(Duration::from_millis(50), 0.5);
        assert_eq!(ep.rolling_latency(), Some(Duration::from_millis(75)));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_window_excludes_and_rolls_over() {
        let window = Duration::from_secs(60);
        let ep = endpoint("https://a.example.com");

        // 8 of an assumed 10 hits the 0.8 buffer.
        for _ in 0..8 {
            ep.note_request(window);
        }
        assert!(ep.soft_limited(window, 0.8, 10));
        let (usage, crossed) = ep.soft_usage(window, 0.8, 10);
        assert!((usage - 0.8).abs() < f64::EPSILON);
        assert!(crossed);
        // The warning only fires once per window.
        let (_, crossed_again) = ep.soft_usage(window, 0.8, 10);
        assert!(!crossed_again);

        tokio::time::advance(window).await;
        assert!(!ep.soft_limited(window, 0.8, 10));
    }

    #[test]
    fn registry_orders_by_priority_then_config_order() {
        let registry = EndpointRegistry::from_config(&[
            EndpointConfig {
                url: Url::parse("https://b.example.com").unwrap(),
                priority: 1,
            },
            EndpointConfig {
                url: Url::parse("https://a.example.com").unwrap(),
                priority: 0,
            },
            EndpointConfig {
                url: Url::parse("https://c.example.com").unwrap(),
                priority: 1,
            },
        ]);
        let order: Vec<_> = registry
            .all()
            .iter()
            .map(|e| e.url().host_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["a.example.com", "b.example.com", "c.example.com"]);
    }

    #[test]
    fn list_healthy_filters_by_current_state() {
        let registry = EndpointRegistry::from_config(&[
            EndpointConfig {
                url: Url::parse("https://a.example.com").unwrap(),
                priority: 0,
            },
            EndpointConfig {
                url: Url::parse("https://b.example.com").unwrap(),
                priority: 0,
            },
        ]);
        registry.all()[0].record_probe_success(Duration::from_millis(5), 0.5);
        registry.all()[1].record_probe_failure(0.5);

        let healthy = registry.list_healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id(), registry.all()[0].id());
        assert_eq!(registry.healthy_count(), 1);
    }
}
