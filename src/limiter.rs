//! Sliding-window rate limiting with per-scope backoff.
//!
//! Scopes are independent named buckets (the `global` scope plus one per
//! resource key) created lazily on first use and kept for the process
//! lifetime. Every admission is gated twice: the global scope and the
//! resource scope must both allow.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LimiterSettings;
use crate::event::{EventBus, Notification};

/// Name of the scope every request is gated against in addition to its
/// resource scope.
pub const GLOBAL_SCOPE: &str = "global";

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A backoff window opened by an earlier denial is still active.
    BackoffActive,
    /// The sliding window has no remaining budget.
    LimitExceeded,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::BackoffActive => write!(f, "backoff active"),
            DenyReason::LimitExceeded => write!(f, "limit exceeded"),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied {
        reason: DenyReason,
        /// Earliest point at which a retry can succeed.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// One scope's sliding-window counters.
#[derive(Debug)]
struct ScopeState {
    window_start: Instant,
    requests_in_window: u32,
    /// Scalable copies of the configured limit and burst allowance;
    /// `increase_delay`/`decrease_delay` adjust these in place.
    limit: f64,
    burst_allowance: f64,
    backoff_until: Option<Instant>,
    consecutive_failures: u32,
}

impl ScopeState {
    fn new(settings: &LimiterSettings) -> Self {
        Self {
            window_start: Instant::now(),
            requests_in_window: 0,
            limit: f64::from(settings.max_requests),
            burst_allowance: f64::from(settings.burst_allowance),
            backoff_until: None,
            consecutive_failures: 0,
        }
    }
}

/// Sliding-window rate limiter over lazily-created named scopes.
pub struct RateLimiter {
    settings: LimiterSettings,
    scopes: DashMap<String, ScopeState>,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(settings: LimiterSettings, events: EventBus) -> Self {
        Self {
            settings,
            scopes: DashMap::new(),
            events,
        }
    }

    /// Check one scope for admission of `weight` requests.
    ///
    /// Order: an active backoff denies first; an expired window resets;
    /// then the window budget (limit + burst) decides. A denial bumps the
    /// consecutive-failure count and opens an exponential backoff; an
    /// admission counts the weight and decays the failure count.
    pub fn check(&self, scope: &str, weight: u32) -> Decision {
        let mut entry = self
            .scopes
            .entry(scope.to_string())
            .or_insert_with(|| ScopeState::new(&self.settings));
        let state = entry.value_mut();
        let now = Instant::now();

        if let Some(until) = state.backoff_until {
            if now < until {
                return Decision::Denied {
                    reason: DenyReason::BackoffActive,
                    retry_after: until - now,
                };
            }
        }

        if now.duration_since(state.window_start) >= self.settings.window() {
            state.window_start = now;
            state.requests_in_window = 0;
        }

        if f64::from(state.requests_in_window + weight) > state.limit + state.burst_allowance {
            state.consecutive_failures += 1;
            let backoff = self.backoff_for(state.consecutive_failures);
            state.backoff_until = Some(now + backoff);
            warn!(
                scope,
                current = state.requests_in_window,
                limit = state.limit,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limit exceeded"
            );
            self.events.emit(Notification::RateLimitExceeded {
                scope: scope.to_string(),
                current: state.requests_in_window,
                limit: state.limit,
            });
            return Decision::Denied {
                reason: DenyReason::LimitExceeded,
                retry_after: backoff,
            };
        }

        state.requests_in_window += weight;
        state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
        Decision::Allowed
    }

    /// Gate one attempt against the global scope and its resource scope.
    /// Both must allow; the global scope is checked (and counted) first.
    pub fn check_request(&self, resource_scope: &str, weight: u32) -> Decision {
        let global = self.check(GLOBAL_SCOPE, weight);
        if !global.is_allowed() || resource_scope == GLOBAL_SCOPE {
            return global;
        }
        self.check(resource_scope, weight)
    }

    /// Caller-driven backoff override, e.g. on an explicit over-limit
    /// signal from the remote side. The applied duration is the larger of
    /// the scope's computed backoff and `explicit`.
    pub fn apply_backoff(&self, scope: &str, explicit: Option<Duration>) -> Duration {
        let mut entry = self
            .scopes
            .entry(scope.to_string())
            .or_insert_with(|| ScopeState::new(&self.settings));
        let state = entry.value_mut();
        let computed = self.backoff_for(state.consecutive_failures.max(1));
        let duration = explicit.map_or(computed, |d| computed.max(d));
        state.backoff_until = Some(Instant::now() + duration);
        debug!(scope, backoff_ms = duration.as_millis() as u64, "Backoff applied");
        self.events.emit(Notification::BackoffApplied {
            scope: scope.to_string(),
            duration,
        });
        duration
    }

    /// Tighten every existing scope by `pct` (adaptive throttle hook;
    /// scopes created later start from the configured defaults).
    pub fn increase_delay(&self, pct: f64) {
        self.scale_scopes(1.0 - pct);
    }

    /// Relax every existing scope by `pct`.
    pub fn decrease_delay(&self, pct: f64) {
        self.scale_scopes(1.0 + pct);
    }

    fn scale_scopes(&self, factor: f64) {
        for mut entry in self.scopes.iter_mut() {
            let state = entry.value_mut();
            state.limit *= factor;
            state.burst_allowance *= factor;
        }
        debug!(factor, scopes = self.scopes.len(), "Scaled scope limits");
    }

    /// Exponential backoff for the given failure count, capped at the
    /// configured maximum.
    fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(64) as i32;
        let ms = (self.settings.backoff_base_ms as f64
            * self.settings.backoff_multiplier.powi(exponent))
        .min(self.settings.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Number of scopes created so far.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    #[cfg(test)]
    fn limit_of(&self, scope: &str) -> Option<f64> {
        self.scopes.get(scope).map(|s| s.limit)
    }
}
