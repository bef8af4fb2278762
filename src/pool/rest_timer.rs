//! Rest-timer scheduler (spec §4.2, §9 open question (a)).
//!
//! The source project emits its "proxy available" notification after a
//! rest-timer extension on some code paths but not others; the spec
//! mandates a single Rust-native scheduler task that covers both cases
//! uniformly, which is what this module is — a redesign, not a port.
//!
//! A single background task tracks the smallest future `rest_till` across
//! active proxies. When that moment arrives it re-scans for the next
//! smallest and notifies waiters; setting an earlier `rest_till`
//! preempts the task via `recompute_rest`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::trace;

use super::selection::smallest_future_rest_till;
use super::ProxyPool;

pub(crate) fn spawn(pool: Arc<ProxyPool>) {
    tokio::spawn(async move {
        loop {
            let next = {
                let state = pool.state.lock();
                smallest_future_rest_till(&state)
            };

            let sleep = match next {
                Some(t) => {
                    let now = Utc::now();
                    if t <= now {
                        StdDuration::from_millis(0)
                    } else {
                        (t - now).to_std().unwrap_or(StdDuration::from_secs(1))
                    }
                }
                // Nothing resting: wait for a recompute signal (a new
                // rest_till being set) rather than busy-polling.
                None => StdDuration::from_secs(3600),
            };

            let recompute = pool.recompute_rest.notified();
            tokio::pin!(recompute);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    trace!("rest timer fired, rescanning");
                    pool.available.notify_waiters();
                }
                _ = &mut recompute => {
                    trace!("rest timer preempted by an earlier rest_till");
                }
            }
        }
    });
}
