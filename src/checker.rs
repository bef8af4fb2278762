//! `Checker` (spec C3): concurrently validates individual proxies against
//! reference HTTP/HTTPS endpoints and updates their health state.
//!
//! Grounded on `proxytools/proxychecker.py`'s probe sequencing, using the
//! teacher's bounded-concurrency idiom (`buffer_unordered`) in place of
//! the Python project's gevent worker pool.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CheckerConfig;
use crate::model::{HistoryKind, Proxy, ProxyType};
use crate::pool::{ProxyPool, RecheckHandle};

/// Validator: probes each proxy against a reference echo endpoint and
/// reports the outcome back through the Pool's own entry points, never
/// mutating `Proxy` fields directly (spec §5 locking discipline).
pub struct Checker {
    config: CheckerConfig,
    /// Idempotency set: an addr already being probed is skipped, per
    /// `proxychecker.py`'s `_processing` set.
    processing: Mutex<HashSet<String>>,
    pool: Arc<ProxyPool>,
    /// Set right after construction so `enqueue()` (a `&self` method
    /// called from inside the Pool's mutex-guarded maintenance pass) can
    /// spawn an owned recheck task without the Pool ever holding an `Arc`
    /// back to the Checker (spec §9 "cyclic references" note, same
    /// pattern as `Fetcher::self_handle`).
    self_handle: OnceLock<Weak<Checker>>,
}

impl Checker {
    pub fn new(config: CheckerConfig, pool: Arc<ProxyPool>) -> Arc<Self> {
        let checker = Arc::new(Self {
            config,
            processing: Mutex::new(HashSet::new()),
            pool,
            self_handle: OnceLock::new(),
        });
        let _ = checker.self_handle.set(Arc::downgrade(&checker));
        checker
    }

    /// True iff no probes are currently in flight.
    pub fn ready(&self) -> bool {
        self.processing.lock().is_empty()
    }

    /// Probe one proxy (spec §4.3 `check(p)`). Exactly one outcome is
    /// produced and fed into `pool.proxy()`, unless the proxy is skipped
    /// for being blacklisted or already in flight.
    pub async fn check(&self, mut candidate: Proxy) {
        if candidate.blacklist {
            return;
        }
        {
            let mut processing = self.processing.lock();
            if !processing.insert(candidate.addr.clone()) {
                debug!(addr = %candidate.addr, "already being checked, skipping");
                return;
            }
        }

        let is_http_family = candidate
            .types
            .iter()
            .any(|t| matches!(t, ProxyType::Http | ProxyType::Https));
        let supports_https_probe = candidate.types.iter().any(|t| {
            matches!(
                t,
                ProxyType::Https | ProxyType::Socks4 | ProxyType::Socks5
            )
        });

        let outcome = if (supports_https_probe && self.config.https_check)
            || self.config.https_force_check
        {
            let target = self
                .config
                .targets
                .iter()
                .find(|t| t.starts_with("https://"))
                .cloned();
            let result = self.probe(&candidate, target).await;
            if is_http_family {
                match &result {
                    Ok(_) => {
                        candidate.types.insert(ProxyType::Https);
                    }
                    Err(_) => {
                        candidate.types.remove(&ProxyType::Https);
                    }
                }
            }
            Some(result)
        } else if self.config.http_check {
            let target = self
                .config
                .targets
                .iter()
                .find(|t| t.starts_with("http://"))
                .cloned();
            Some(self.probe(&candidate, target).await)
        } else {
            None
        };

        if let Some(outcome) = outcome {
            let now = Utc::now();
            match outcome {
                Ok(speed) => {
                    candidate.success_at = Some(now);
                    candidate.fail = 0;
                    candidate.speed = Some(speed);
                    candidate.set_history(
                        now,
                        HistoryKind::Success,
                        None,
                        None,
                        self.config.history_size,
                    );
                }
                Err(reason) => {
                    candidate.fail_at = Some(now);
                    candidate.fail += 1;
                    candidate.set_history(
                        now,
                        HistoryKind::Fail,
                        Some(reason),
                        None,
                        self.config.history_size,
                    );
                }
            }
        }

        self.processing.lock().remove(&candidate.addr);
        self.pool.proxy(candidate, false);
    }

    /// Issue one probe request through `candidate`'s upstream, returning
    /// the measured speed (KB/s) on success.
    async fn probe(&self, candidate: &Proxy, target: Option<String>) -> Result<f64, String> {
        let Some(target) = target else {
            return Err("no reference target configured for this probe".to_string());
        };
        let upstream = reqwest::Proxy::all(candidate.url()).map_err(|e| e.to_string())?;
        let probing_client = reqwest::Client::builder()
            .cookie_store(false)
            .pool_max_idle_per_host(1)
            .timeout(Duration::from_secs(self.config.timeout))
            .proxy(upstream)
            .build()
            .map_err(|e| e.to_string())?;

        let started = std::time::Instant::now();
        let resp = probing_client
            .get(&target)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("non-2xx status {}", resp.status()));
        }
        let body = resp.bytes().await.map_err(|e| e.to_string())?;
        let elapsed = started.elapsed().as_secs_f64().max(0.001);

        let has_marker = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .map(|v| v.get("origin").is_some() || v.get("headers").is_some())
            .unwrap_or(false);
        if !has_marker {
            return Err("response missing expected JSON marker".to_string());
        }

        let kb = body.len() as f64 / 1024.0;
        Ok(kb / elapsed)
    }

    /// Run the checker to quiescence over a fixed batch, bounded at
    /// `pool_size` concurrent probes (used by the `checker` CLI command).
    pub async fn check_all(self: &Arc<Self>, candidates: Vec<Proxy>) {
        let pool_size = self.config.pool_size;
        stream::iter(candidates)
            .map(|p| {
                let checker = Arc::clone(self);
                async move { checker.check(p).await }
            })
            .buffer_unordered(pool_size)
            .for_each(|_| async {})
            .await;
    }
}

impl RecheckHandle for Checker {
    /// Fire-and-forget a recheck probe for a proxy the Pool's maintenance
    /// pass found stale (spec §4.2 `maybe_update`'s "enqueue for
    /// recheck"). Runs on a detached task rather than blocking the
    /// caller, which is the Pool's own maintenance pass.
    fn enqueue(&self, proxy: Proxy) {
        let Some(weak) = self.self_handle.get() else {
            return;
        };
        let Some(checker) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            checker.check(proxy).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    #[test]
    fn ready_when_nothing_processing() {
        let pool = ProxyPool::new(crate::config::PoolConfig::default());
        let checker = Checker::new(CheckerConfig::default(), pool);
        assert!(checker.ready());
    }

    #[tokio::test]
    async fn unreachable_target_records_a_failure() {
        let pool = ProxyPool::new(crate::config::PoolConfig::default());
        let mut config = CheckerConfig::default();
        config.targets = vec!["http://127.0.0.1:1".to_string()];
        config.https_check = false;
        config.https_force_check = false;
        let checker = Checker::new(config, Arc::clone(&pool));

        let proxy = Proxy::new("127.0.0.1:1", Set::from([ProxyType::Http])).unwrap();
        checker.check(proxy).await;

        // the checker forwarded the outcome into the pool, which
        // blacklists on fail_at > success_at for a fresh, never-loaded proxy
        assert!(pool.get_by_addr("127.0.0.1:1").is_some());
    }
}
