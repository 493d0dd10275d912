//! Handle selection strategies.
//!
//! All strategies operate on the eligible list in stable pool order
//! (creation order), and all ties resolve to the first handle in that
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LoadBalanceStrategy;

use super::ConnectionHandle;

/// Pick a handle from the non-empty eligible list.
pub(super) fn pick<'a>(
    eligible: &'a [Arc<ConnectionHandle>],
    strategy: LoadBalanceStrategy,
    rr_cursor: &AtomicUsize,
) -> &'a Arc<ConnectionHandle> {
    match strategy {
        LoadBalanceStrategy::RoundRobin => {
            let i = rr_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
            &eligible[i]
        }
        // Selection deliberately ignores how close the endpoint is to its
        // soft rate cap; the eligibility filter is the only interaction.
        LoadBalanceStrategy::Fastest => min_stable(eligible, |h| {
            h.endpoint().rolling_latency().unwrap_or(Duration::MAX)
        }),
        LoadBalanceStrategy::LeastLoaded => min_stable(eligible, |h| h.active_requests()),
    }
}

/// Minimum by key, keeping the first element on ties (unlike
/// `Iterator::min_by_key`, which keeps the last).
fn min_stable<K: Ord>(
    eligible: &[Arc<ConnectionHandle>],
    key: impl Fn(&ConnectionHandle) -> K,
) -> &Arc<ConnectionHandle> {
    let mut best = &eligible[0];
    let mut best_key = key(best);
    for handle in &eligible[1..] {
        let k = key(handle);
        if k < best_key {
            best = handle;
            best_key = k;
        }
    }
    best
}
