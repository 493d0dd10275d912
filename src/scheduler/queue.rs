//! Priority retry queue with defined tie-break semantics.
//!
//! Ordering: highest priority first, then arrival sequence. Requeued items
//! are assigned a fresh sequence number, which places them at the tail,
//! so a retry can never overtake a fresh item of higher-or-equal priority.
//! Items also carry an `eligible_at` instant; `pop_eligible` skips items
//! whose delay has not elapsed, which renders the per-item requeue waits.

use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::error::Error;

/// One attempt of a submitted operation. Re-invoked on every retry; the
/// `Ok` arm has already settled the caller's future with the success
/// value, so only errors flow back to the drain loop.
pub(crate) type AttemptFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Settles the caller's future with a terminal error. Safe to call more
/// than once; only the first call wins.
pub(crate) type RejectFn = Box<dyn Fn(Error) + Send + Sync>;

/// One pending caller operation.
pub(crate) struct QueuedRequest {
    pub(crate) attempt: AttemptFn,
    pub(crate) reject: RejectFn,
    /// Resource scope for rate-limit gating.
    pub(crate) scope: String,
    pub(crate) priority: i32,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    /// Arrival sequence, assigned by the queue on every push.
    pub(crate) seq: u64,
    /// Earliest instant at which the drain loop may pick this item.
    pub(crate) eligible_at: Instant,
}

/// In-memory priority queue owned by the scheduler.
pub(crate) struct RetryQueue {
    items: Vec<QueuedRequest>,
    next_seq: u64,
}

impl RetryQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            next_seq: 0,
        }
    }

    /// Append an item, stamping its arrival sequence. Requeues go through
    /// here too and therefore land at the tail.
    pub(crate) fn push(&mut self, mut item: QueuedRequest) {
        item.seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(item);
    }

    /// Remove and return the best eligible item: highest priority, then
    /// earliest arrival. Returns `None` when nothing is eligible.
    pub(crate) fn pop_eligible(&mut self, now: Instant) -> Option<QueuedRequest> {
        let mut best: Option<usize> = None;
        for (i, item) in self.items.iter().enumerate() {
            if item.eligible_at > now {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let current = &self.items[b];
                    if item.priority > current.priority
                        || (item.priority == current.priority && item.seq < current.seq)
                    {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best.map(|i| self.items.remove(i))
    }

    /// Take everything still queued (shutdown path).
    pub(crate) fn drain_all(&mut self) -> Vec<QueuedRequest> {
        std::mem::take(&mut self.items)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(priority: i32, eligible_at: Instant) -> QueuedRequest {
        QueuedRequest {
            attempt: Box::new(|| Box::pin(async { Ok(()) })),
            reject: Box::new(|_| {}),
            scope: "test".to_string(),
            priority,
            retry_count: 0,
            max_retries: 0,
            seq: 0,
            eligible_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pops_highest_priority_first() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        queue.push(item(1, now));
        queue.push(item(5, now));
        queue.push(item(3, now));

        assert_eq!(queue.pop_eligible(now).unwrap().priority, 5);
        assert_eq!(queue.pop_eligible(now).unwrap().priority, 3);
        assert_eq!(queue.pop_eligible(now).unwrap().priority, 1);
        assert!(queue.pop_eligible(now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priorities_preserve_arrival_order() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        queue.push(item(2, now));
        queue.push(item(2, now));
        let first = queue.pop_eligible(now).unwrap();
        let second = queue.pop_eligible(now).unwrap();
        assert!(first.seq < second.seq);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_item_lands_behind_fresh_equal_priority() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        queue.push(item(2, now));
        let retried = queue.pop_eligible(now).unwrap();

        queue.push(item(2, now)); // fresh arrival while the retry was out
        queue.push(retried); // requeue stamps a fresh, larger seq

        let first = queue.pop_eligible(now).unwrap();
        let second = queue.pop_eligible(now).unwrap();
        assert!(first.seq < second.seq);
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_items_are_skipped_until_their_delay_elapses() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        queue.push(item(5, now + Duration::from_secs(2)));
        queue.push(item(1, now));

        // The high-priority item is not eligible yet.
        assert_eq!(queue.pop_eligible(now).unwrap().priority, 1);
        assert!(queue.pop_eligible(now).is_none());
        assert_eq!(queue.len(), 1);

        let later = now + Duration::from_secs(2);
        assert_eq!(queue.pop_eligible(later).unwrap().priority, 5);
    }
}
