//! Priority retry scheduler.
//!
//! Callers submit opaque operations with a priority and a retry budget and
//! get back a future that settles exactly once. A continuously running
//! drain loop admits work under a concurrency cap and the rate limiter's
//! two-level gate, classifies failures, and requeues throttled/transient
//! attempts with growing delays.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SchedulerSettings;
use crate::error::{Error, FailureClass, Result};
use crate::limiter::{Decision, RateLimiter};

mod queue;


use queue::{QueuedRequest, RetryQueue};

/// Aggregate scheduler counters for observability.
#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) rejected: AtomicU64,
}

/// Runtime-tunable admission limits.
#[derive(Debug, Clone, Copy)]
struct AdmissionLimits {
    max_concurrent: usize,
    spacing: Duration,
}

struct SchedulerShared {
    queue: Mutex<RetryQueue>,
    active: AtomicUsize,
    limits: Mutex<AdmissionLimits>,
    settings: SchedulerSettings,
    limiter: Arc<RateLimiter>,
    counters: SchedulerCounters,
    shutting_down: AtomicBool,
}

/// Decrements the active count however the attempt ends.
struct ActiveGuard(Arc<SchedulerShared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Priority retry queue over opaque remote operations.
pub struct RequestScheduler {
    shared: Arc<SchedulerShared>,
    drain_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RequestScheduler {
    pub fn new(settings: SchedulerSettings, limiter: Arc<RateLimiter>) -> Self {
        let limits = AdmissionLimits {
            max_concurrent: settings.max_concurrent,
            spacing: settings.spacing(),
        };
        Self {
            shared: Arc::new(SchedulerShared {
                queue: Mutex::new(RetryQueue::new()),
                active: AtomicUsize::new(0),
                limits: Mutex::new(limits),
                settings,
                limiter,
                counters: SchedulerCounters::default(),
                shutting_down: AtomicBool::new(false),
            }),
            drain_handle: Mutex::new(None),
        }
    }

    /// Spawn the drain loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.drain_handle.lock();
        if handle.is_none() {
            *handle = Some(tokio::spawn(drain_loop(self.shared.clone())));
        }
    }

    /// Submit an operation for execution.
    ///
    /// `scope` names the rate-limit bucket the operation is gated against
    /// (in addition to the global scope). `op` is re-invoked on every
    /// retry and must produce a fresh future each time. The returned
    /// future settles exactly once: with the success value, the terminal
    /// error, or [`Error::Shutdown`] if the scheduler stops before the
    /// operation ever starts.
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
        let (tx, rx) = oneshot::channel::<Result<T>>();

        if self.shared.shutting_down.load(Ordering::SeqCst) {
            let _ = tx.send(Err(Error::Shutdown));
        } else {
            let slot = Arc::new(Mutex::new(Some(tx)));
            let attempt = {
                let slot = slot.clone();
                Box::new(move || {
                    let fut = op();
                    let slot = slot.clone();
                    let boxed: futures_util::future::BoxFuture<'static, Result<()>> =
                        Box::pin(async move {
                            match fut.await {
                                Ok(value) => {
                                    if let Some(tx) = slot.lock().take() {
                                        let _ = tx.send(Ok(value));
                                    }
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            }
                        });
                    boxed
                })
            };
            let reject = Box::new(move |err: Error| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(Err(err));
                }
            });

            self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
            self.shared.queue.lock().push(QueuedRequest {
                attempt,
                reject,
                scope: scope.into(),
                priority,
                retry_count: 0,
                max_retries,
                seq: 0,
                eligible_at: Instant::now(),
            });
        }

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Shutdown),
            }
        }
    }

    /// Tune the admission limits at runtime.
    pub fn set_rate_limit(&self, max_concurrent: usize, spacing: Duration) {
        let mut limits = self.shared.limits.lock();
        limits.max_concurrent = max_concurrent.max(1);
        limits.spacing = spacing;
        info!(
            max_concurrent = limits.max_concurrent,
            spacing_ms = limits.spacing.as_millis() as u64,
            "Scheduler limits updated"
        );
    }

    /// Stop admitting work, wait (bounded) for in-flight operations, then
    /// reject everything still queued with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.shared.settings.shutdown_timeout_ms);
        let poll = Duration::from_millis(self.shared.settings.shutdown_poll_ms);
        while self.shared.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            sleep(poll).await;
        }
        let stragglers = self.shared.active.load(Ordering::SeqCst);
        if stragglers > 0 {
            warn!(stragglers, "Shutdown proceeding with operations still in flight");
        }

        if let Some(handle) = self.drain_handle.lock().take() {
            handle.abort();
        }

        let leftovers = self.shared.queue.lock().drain_all();
        if !leftovers.is_empty() {
            info!(
                discarded = leftovers.len(),
                "Discarding queued requests that never started"
            );
        }
        for item in leftovers {
            (item.reject)(Error::Shutdown);
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of operations currently executing.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of queued, not-yet-started operations.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub(crate) fn counters(&self) -> &SchedulerCounters {
        &self.shared.counters
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.drain_handle.lock().take() {
            handle.abort();
        }
    }
}

/// The continuously running drain loop.
async fn drain_loop(shared: Arc<SchedulerShared>) {
    debug!("Drain loop started");
    loop {
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let limits = *shared.limits.lock();
        if shared.active.load(Ordering::SeqCst) >= limits.max_concurrent {
            sleep(shared.settings.drain_idle()).await;
            continue;
        }

        let item = shared.queue.lock().pop_eligible(Instant::now());
        let Some(mut item) = item else {
            sleep(shared.settings.drain_idle()).await;
            continue;
        };

        match shared.limiter.check_request(&item.scope, 1) {
            Decision::Denied { reason, .. } => {
                debug!(scope = %item.scope, %reason, "Admission denied, requeueing");
                item.eligible_at = Instant::now() + shared.settings.denied_requeue();
                shared.queue.lock().push(item);
                continue;
            }
            Decision::Allowed => {}
        }

        shared.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_attempt(shared.clone(), item));

        // Minimum inter-request spacing between admissions.
        sleep(limits.spacing).await;
    }
    debug!("Drain loop stopped");
}

/// Execute one attempt and route its outcome.
async fn run_attempt(shared: Arc<SchedulerShared>, item: QueuedRequest) {
    let _guard = ActiveGuard(shared.clone());
    let outcome = (item.attempt)().await;
    match outcome {
        Ok(()) => {
            shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => handle_failure(&shared, item, err),
    }
}

/// Classify a failed attempt: requeue with backoff while budget remains,
/// reject otherwise. Fatal errors reject on first occurrence without
/// consuming budget.
fn handle_failure(shared: &Arc<SchedulerShared>, mut item: QueuedRequest, err: Error) {
    let class = err.classify();
    let retryable = matches!(class, FailureClass::Throttled | FailureClass::Transient);

    if retryable && item.retry_count < item.max_retries {
        item.retry_count += 1;
        let delay = match class {
            FailureClass::Throttled => {
                // Penalize the scope so unrelated work backs off too, and
                // escalate the item's own delay past the ladder.
                let penalty = shared.limiter.settings().throttle_penalty();
                shared.limiter.apply_backoff(&item.scope, Some(penalty));
                let escalated = penalty * 2u32.pow(item.retry_count.saturating_sub(1).min(16));
                shared.settings.ladder_delay(item.retry_count).max(escalated)
            }
            _ => shared.settings.ladder_delay(item.retry_count),
        };
        debug!(
            scope = %item.scope,
            retry = item.retry_count,
            max_retries = item.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after backoff"
        );
        shared.counters.retried.fetch_add(1, Ordering::Relaxed);
        item.eligible_at = Instant::now() + delay;
        shared.queue.lock().push(item);
        return;
    }

    let terminal = if retryable {
        Error::ExhaustedRetries {
            attempts: item.retry_count + 1,
            last: Box::new(err),
        }
    } else {
        err
    };
    warn!(scope = %item.scope, error = %terminal, "Request rejected");
    shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
    (item.reject)(terminal);
}
