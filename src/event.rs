//! Typed notifications for lifecycle and throttling telemetry.
//!
//! Components publish [`Notification`] values through a shared [`EventBus`];
//! consumers subscribe for a `broadcast` receiver. Emission never blocks and
//! is lossy for slow subscribers, which is acceptable for telemetry.

use std::time::Duration;

use tokio::sync::broadcast;

/// Events emitted by the connection layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The gateway finished starting.
    Started,
    /// The gateway began shutting down.
    Stopped,
    /// One health-probe round completed.
    HealthCheckComplete {
        total_endpoints: usize,
        healthy_endpoints: usize,
    },
    /// An endpoint's rolling request count crossed the soft buffer and the
    /// endpoint is excluded from selection until its window rolls over.
    RateLimitWarning {
        endpoint: String,
        /// Fraction of the assumed per-endpoint limit consumed.
        usage: f64,
    },
    /// A rate-limit scope denied an admission.
    RateLimitExceeded {
        scope: String,
        current: u32,
        limit: f64,
    },
    /// A backoff window was opened on a scope.
    BackoffApplied { scope: String, duration: Duration },
    /// The pool grew.
    ScaledUp {
        previous_size: usize,
        current_size: usize,
    },
    /// The pool shrank.
    ScaledDown {
        previous_size: usize,
        current_size: usize,
    },
}

/// Broadcast hub for [`Notification`] values.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber before older ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification. A send with no live subscribers is not an
    /// error; telemetry is best-effort.
    pub fn emit(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Notification::Started);
        bus.emit(Notification::ScaledUp {
            previous_size: 2,
            current_size: 4,
        });

        assert_eq!(rx.recv().await.unwrap(), Notification::Started);
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::ScaledUp {
                previous_size: 2,
                current_size: 4
            }
        );
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.emit(Notification::Stopped);
    }
}
