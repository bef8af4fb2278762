//! `ProxyPool` (spec C2): owns all proxy records, enforces lifecycle
//! transitions, selection, waiting, and snapshot I/O.
//!
//! Concurrency: a single [`parking_lot::Mutex`] serialises all state
//! (spec §9's "cooperative vs parallel" note — contention is acceptable,
//! critical sections are short). Selection suspension ("proxy available")
//! is a [`tokio::sync::Notify`] broadcast woken by every mutation that
//! could make a proxy eligible, plus a background rest-timer task.

mod rest_timer;
mod selection;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::{Result, SuperproxyError};
use crate::model::{HistoryKind, Proxy};

pub use selection::{GetOptions, Persist, Strategy, StatusCounters, Wait};

/// One-way callback hook wired by the Fetcher orchestrator at construction
/// (spec §9's "cyclic references and back-pointers" note: the Pool never
/// holds a reference back to the Fetcher, only this small interface).
pub trait FetcherHandle: Send + Sync {
    fn ready(&self) -> bool;
    fn trigger(&self);
}

/// One-way callback hook to the Checker, wired the same way as
/// [`FetcherHandle`]: the Pool enqueues a recheck but never holds a
/// reference back into the Checker's internals.
pub trait RecheckHandle: Send + Sync {
    fn enqueue(&self, proxy: Proxy);
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WaitingEntry {
    pub since: DateTime<Utc>,
    pub request_ident: Option<String>,
    pub params: String,
}

pub(crate) struct PoolState {
    pub active: BTreeMap<String, Proxy>,
    pub blacklist: BTreeMap<String, Proxy>,
    pub waiting: HashMap<u64, WaitingEntry>,
    /// Shared per-upstream-proxy HTTP clients, so that all brokered
    /// sessions reuse TCP connections to the same proxy (spec §3/§5).
    pub pool_manager: HashMap<String, Arc<reqwest::Client>>,
    pub pool_manager_touched: HashMap<String, DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

pub struct ProxyPool {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) config: PoolConfig,
    pub(crate) fetcher: Mutex<Option<Arc<dyn FetcherHandle>>>,
    pub(crate) recheck: Mutex<Option<Arc<dyn RecheckHandle>>>,
    pub(crate) available: Arc<Notify>,
    pub(crate) recompute_rest: Arc<Notify>,
    next_waiter_id: AtomicU64,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            state: Mutex::new(PoolState {
                active: BTreeMap::new(),
                blacklist: BTreeMap::new(),
                waiting: HashMap::new(),
                pool_manager: HashMap::new(),
                pool_manager_touched: HashMap::new(),
                last_update: None,
                started_at: Utc::now(),
            }),
            config,
            fetcher: Mutex::new(None),
            recheck: Mutex::new(None),
            available: Arc::new(Notify::new()),
            recompute_rest: Arc::new(Notify::new()),
            next_waiter_id: AtomicU64::new(1),
        });
        rest_timer::spawn(Arc::clone(&pool));
        pool
    }

    pub fn set_fetcher(&self, fetcher: Arc<dyn FetcherHandle>) {
        *self.fetcher.lock() = Some(fetcher);
    }

    pub fn set_recheck_handle(&self, handle: Arc<dyn RecheckHandle>) {
        *self.recheck.lock() = Some(handle);
    }

    fn notify_available(&self) {
        self.available.notify_waiters();
    }

    // ---- ingestion -----------------------------------------------------

    /// Ingest a candidate proxy (spec §4.2 `proxy()`).
    pub fn proxy(&self, mut candidate: Proxy, load: bool) {
        let mut state = self.state.lock();
        let addr = candidate.addr.clone();

        if let Some(existing) = state.blacklist.get_mut(&addr) {
            let later_success = match (candidate.success_at, candidate.fail_at) {
                (Some(s), Some(f)) => s > f,
                (Some(_), None) => true,
                _ => false,
            };
            existing.merge_meta(&candidate);
            if later_success {
                let mut reinstated = state.blacklist.remove(&addr).unwrap();
                reinstated.blacklist = false;
                reinstated.fail = 0;
                state.active.insert(addr.clone(), reinstated);
                drop(state);
                self.notify_available();
                return;
            }
            return;
        }

        let should_blacklist = candidate.blacklist
            || (!load
                && match (candidate.fail_at, candidate.success_at) {
                    (Some(f), Some(s)) => f > s,
                    (Some(_), None) => true,
                    _ => false,
                });

        if should_blacklist {
            candidate.blacklist = true;
            state.pool_manager.remove(&candidate.url());
            state.active.remove(&addr);
            state.blacklist.insert(addr, candidate);
            return;
        }

        if let Some(existing) = state.active.get_mut(&addr) {
            existing.merge_meta(&candidate);
            return;
        }

        state.active.insert(addr, candidate);
        drop(state);
        self.notify_available();
    }

    // ---- outcome reporting ----------------------------------------------

    /// Record a failure (spec §4.2 `fail()`).
    pub fn fail(&self, addr: &str, timeout: Option<u64>, reason: Option<String>, ident: Option<String>) {
        let mut state = self.state.lock();
        let Some(proxy) = state.active.get_mut(addr) else {
            return;
        };
        let now = Utc::now();
        proxy.fail_at = Some(now);
        proxy.fail += 1;
        proxy.in_use = proxy.in_use.saturating_sub(1);
        let history_size = self.config.history_size;
        proxy.set_history(now, HistoryKind::Fail, reason, ident, history_size);

        if proxy.fail >= self.config.max_fail {
            let mut blacklisted = state.active.remove(addr).unwrap();
            blacklisted.blacklist = true;
            state.pool_manager.remove(&blacklisted.url());
            state.blacklist.insert(addr.to_string(), blacklisted);
            debug!(addr, "proxy blacklisted after repeated failures");
            return;
        }

        let resting = if let Some(timeout) = timeout {
            proxy.set_rest_till(now + chrono::Duration::seconds(timeout as i64));
            true
        } else {
            false
        };
        drop(state);
        if resting {
            self.recompute_rest.notify_waiters();
        } else {
            self.notify_available();
        }
    }

    /// Record a success (spec §4.2 `success()`).
    pub fn success(&self, addr: &str, timeout: Option<u64>, ident: Option<String>) {
        let mut state = self.state.lock();
        let Some(proxy) = state.active.get_mut(addr) else {
            return;
        };
        let now = Utc::now();
        proxy.success_at = Some(now);
        proxy.fail = 0;
        proxy.in_use = proxy.in_use.saturating_sub(1);
        let history_size = self.config.history_size;
        proxy.set_history(now, HistoryKind::Success, None, ident, history_size);
        if let Some(timeout) = timeout {
            proxy.set_rest_till(now + chrono::Duration::seconds(timeout as i64));
        }
        drop(state);
        self.recompute_rest.notify_waiters();
        self.notify_available();
    }

    /// Force a rest period, e.g. on a rate-limit response (spec §4.2
    /// `rest()`). Treated as a success for fail-counter purposes.
    pub fn rest(&self, addr: &str, timeout: u64, reason: Option<String>, ident: Option<String>) -> Result<()> {
        if timeout == 0 {
            return Err(SuperproxyError::Internal(
                "rest() requires timeout > 0".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let Some(proxy) = state.active.get_mut(addr) else {
            return Ok(());
        };
        let now = Utc::now();
        proxy.success_at = Some(now);
        proxy.fail = 0;
        proxy.in_use = proxy.in_use.saturating_sub(1);
        proxy.set_rest_till(now + chrono::Duration::seconds(timeout as i64));
        let history_size = self.config.history_size;
        proxy.set_history(now, HistoryKind::Rest, reason, ident, history_size);
        drop(state);
        self.recompute_rest.notify_waiters();
        Ok(())
    }

    // ---- blacklist lifecycle --------------------------------------------

    pub fn blacklist(&self, addr: &str, load: bool) {
        let mut state = self.state.lock();
        if let Some(mut proxy) = state.active.remove(addr) {
            proxy.blacklist = true;
            state.pool_manager.remove(&proxy.url());
            state.blacklist.insert(addr.to_string(), proxy);
        } else if let Some(proxy) = state.blacklist.get_mut(addr) {
            proxy.blacklist = true;
        } else {
            return;
        }
        drop(state);
        if !load {
            self.maybe_update(Utc::now());
        }
    }

    pub fn unblacklist(&self, addr: &str) {
        let mut state = self.state.lock();
        if let Some(mut proxy) = state.blacklist.remove(addr) {
            proxy.blacklist = false;
            proxy.fail = 0;
            state.active.insert(addr.to_string(), proxy);
            drop(state);
            self.notify_available();
        }
    }

    pub fn get_by_addr(&self, addr: &str) -> Option<Proxy> {
        let state = self.state.lock();
        state
            .active
            .get(addr)
            .or_else(|| state.blacklist.get(addr))
            .cloned()
    }

    // ---- shared connection-pool manager ---------------------------------

    /// Returns the shared `reqwest::Client` for connecting through this
    /// proxy's upstream, creating one (pre-sized to `max_simultaneous`) if
    /// absent.
    pub fn client_for(&self, proxy_url: &str) -> Result<Arc<reqwest::Client>> {
        let mut state = self.state.lock();
        if let Some(client) = state.pool_manager.get(proxy_url) {
            state
                .pool_manager_touched
                .insert(proxy_url.to_string(), Utc::now());
            return Ok(Arc::clone(client));
        }
        let upstream = reqwest::Proxy::all(proxy_url)
            .map_err(|e| SuperproxyError::Internal(e.to_string()))?;
        let client = Arc::new(
            reqwest::Client::builder()
                .proxy(upstream)
                .pool_max_idle_per_host(self.config.max_simultaneous as usize)
                .build()
                .map_err(|e| SuperproxyError::Internal(e.to_string()))?,
        );
        state
            .pool_manager
            .insert(proxy_url.to_string(), Arc::clone(&client));
        state
            .pool_manager_touched
            .insert(proxy_url.to_string(), Utc::now());
        Ok(client)
    }

    // ---- maintenance -----------------------------------------------------

    fn need_update(&self, state: &PoolState) -> bool {
        state.active.len() < self.config.min_size
    }

    /// Debounced maintenance (spec §4.2 `maybe_update`). Non-blocking: any
    /// triggered fetch runs asynchronously via the `FetcherHandle`.
    pub fn maybe_update(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_update {
            if (now - last).num_seconds() < self.config.update_timeout as i64 {
                return;
            }
        }
        state.last_update = Some(now);

        let need_update = self.need_update(&state);
        let fetcher = self.fetcher.lock().clone();
        if need_update {
            if let Some(fetcher) = &fetcher {
                if fetcher.ready() {
                    info!("pool below min_size, triggering fetcher");
                    fetcher.trigger();
                }
            }
        }

        let recheck_before = now - chrono::Duration::seconds(self.config.recheck_timeout as i64);
        let pool_manager_before =
            now - chrono::Duration::seconds(self.config.pool_manager_timeout as i64);
        let due_for_recheck: Vec<Proxy> = state
            .active
            .values()
            .filter(|p| p.in_use == 0 && p.used_at().map(|t| t < recheck_before).unwrap_or(true))
            .cloned()
            .collect();
        let stale_pool_entries: Vec<String> = state
            .pool_manager_touched
            .iter()
            .filter(|(_, touched)| **touched < pool_manager_before)
            .map(|(url, _)| url.clone())
            .collect();
        for url in stale_pool_entries {
            state.pool_manager.remove(&url);
            state.pool_manager_touched.remove(&url);
        }

        let blacklist_before =
            now - chrono::Duration::seconds(self.config.blacklist_timeout as i64);
        let expired: Vec<String> = state
            .blacklist
            .iter()
            .filter(|(_, p)| p.used_at().map(|t| t < blacklist_before).unwrap_or(false))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in expired {
            state.blacklist.remove(&addr);
        }
        drop(state);

        if !due_for_recheck.is_empty() {
            if let Some(handle) = self.recheck.lock().clone() {
                for proxy in due_for_recheck {
                    debug!(addr = %proxy.addr, "proxy due for recheck, enqueuing");
                    handle.enqueue(proxy);
                }
            }
        }
    }

    // ---- snapshot I/O -----------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.lock();
        let all: Vec<&Proxy> = state.active.values().chain(state.blacklist.values()).collect();
        let json = serde_json::to_vec_pretty(&all)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let proxies: Vec<Proxy> = serde_json::from_str(&raw)?;
        let count = proxies.len();
        for proxy in proxies {
            self.proxy(proxy, true);
        }
        info!(count, "loaded proxy snapshot");
        Ok(())
    }

    // ---- introspection (admin endpoints) ---------------------------------

    pub fn status_counters(&self) -> StatusCounters {
        let state = self.state.lock();
        let now = Utc::now();
        StatusCounters {
            active: state.active.len(),
            resting: state.active.values().filter(|p| p.is_resting(now)).count(),
            blacklisted: state.blacklist.len(),
            in_use: state.active.values().map(|p| p.in_use).sum(),
            waiting: state.waiting.len(),
            need_update: self.need_update(&state),
            started_at: state.started_at,
            updated_at: state.last_update,
        }
    }

    pub fn list_active(&self) -> Vec<Proxy> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn list_blacklisted(&self) -> Vec<Proxy> {
        self.state.lock().blacklist.values().cloned().collect()
    }

    pub fn list_waiting(&self) -> HashMap<u64, WaitingEntry> {
        self.state.lock().waiting.clone()
    }

    pub fn forget_blacklist(&self, used_at_before: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .blacklist
            .iter()
            .filter(|(_, p)| p.used_at().map(|t| t < used_at_before).unwrap_or(false))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &expired {
            state.blacklist.remove(addr);
        }
        expired.len()
    }

    pub fn reset_rest_till(&self, addr: &str) {
        let mut state = self.state.lock();
        if let Some(proxy) = state.active.get_mut(addr) {
            proxy.rest_till = None;
        }
        drop(state);
        self.notify_available();
    }

    pub(crate) fn next_waiter_id(&self) -> u64 {
        self.next_waiter_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop a proxy's shared upstream client, e.g. after an admin operator
    /// suspects a poisoned connection pool for that upstream (spec §6
    /// `clear_pool_manager` action).
    pub fn clear_pool_manager(&self, proxy_url: &str) {
        let mut state = self.state.lock();
        state.pool_manager.remove(proxy_url);
        state.pool_manager_touched.remove(proxy_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProxyType;
    use std::collections::HashSet as Set;

    fn http_proxy(addr: &str) -> Proxy {
        Proxy::new(addr, Set::from([ProxyType::Http])).unwrap()
    }

    fn pool_with(config: PoolConfig) -> Arc<ProxyPool> {
        ProxyPool::new(config)
    }

    #[test]
    fn proxy_ingests_a_fresh_candidate_into_active() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        assert_eq!(pool.list_active().len(), 1);
        assert!(pool.list_blacklisted().is_empty());
    }

    #[test]
    fn proxy_blacklists_a_candidate_with_fail_after_success() {
        let pool = pool_with(PoolConfig::default());
        let mut candidate = http_proxy("1.2.3.4:80");
        let t0 = Utc::now();
        candidate.success_at = Some(t0);
        candidate.fail_at = Some(t0 + chrono::Duration::seconds(5));
        pool.proxy(candidate, false);
        assert!(pool.list_active().is_empty());
        assert_eq!(pool.list_blacklisted().len(), 1);
    }

    #[test]
    fn proxy_reinstates_a_blacklisted_addr_on_later_success() {
        let pool = pool_with(PoolConfig::default());
        let mut candidate = http_proxy("1.2.3.4:80");
        candidate.blacklist = true;
        pool.proxy(candidate, true);
        assert_eq!(pool.list_blacklisted().len(), 1);

        let mut rediscovered = http_proxy("1.2.3.4:80");
        let t0 = Utc::now();
        rediscovered.fail_at = Some(t0);
        rediscovered.success_at = Some(t0 + chrono::Duration::seconds(5));
        pool.proxy(rediscovered, false);

        assert!(pool.list_blacklisted().is_empty());
        assert_eq!(pool.list_active().len(), 1);
    }

    #[test]
    fn proxy_merges_meta_for_a_repeat_active_observation() {
        let pool = pool_with(PoolConfig::default());
        let mut first = http_proxy("1.2.3.4:80");
        first.country = Some("US".to_string());
        pool.proxy(first, false);

        let mut second = http_proxy("1.2.3.4:80");
        second.types.insert(ProxyType::Https);
        second.fetch_sources.insert("spysone".to_string());
        pool.proxy(second, false);

        let merged = pool.get_by_addr("1.2.3.4:80").unwrap();
        assert_eq!(merged.country.as_deref(), Some("US"));
        assert!(merged.types.contains(&ProxyType::Https));
        assert!(merged.fetch_sources.contains("spysone"));
    }

    #[tokio::test]
    async fn active_and_blacklist_never_share_an_addr() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        let proxy = pool.get(GetOptions::default()).await.unwrap();
        pool.blacklist(&proxy.addr, false);
        assert!(pool.get_by_addr("1.2.3.4:80").is_some());
        assert!(pool.list_active().is_empty());
        assert_eq!(pool.list_blacklisted().len(), 1);
    }

    #[test]
    fn fail_decrements_in_use_and_blacklists_past_max_fail() {
        let mut config = PoolConfig::default();
        config.max_fail = 2;
        let pool = pool_with(config);
        let mut candidate = http_proxy("1.2.3.4:80");
        candidate.in_use = 1;
        pool.proxy(candidate, true);

        pool.fail("1.2.3.4:80", None, Some("first".to_string()), None);
        let after_one = pool.get_by_addr("1.2.3.4:80").unwrap();
        assert_eq!(after_one.fail, 1);
        assert_eq!(after_one.in_use, 0);
        assert!(pool.list_active().iter().any(|p| p.addr == "1.2.3.4:80"));

        pool.fail("1.2.3.4:80", None, Some("second".to_string()), None);
        assert!(pool.list_blacklisted().iter().any(|p| p.addr == "1.2.3.4:80"));
    }

    #[test]
    fn success_resets_fail_counter() {
        let pool = pool_with(PoolConfig::default());
        let mut candidate = http_proxy("1.2.3.4:80");
        candidate.fail = 2;
        pool.proxy(candidate, true);
        pool.success("1.2.3.4:80", None, None);
        let proxy = pool.get_by_addr("1.2.3.4:80").unwrap();
        assert_eq!(proxy.fail, 0);
        assert!(proxy.success_at.is_some());
    }

    #[test]
    fn rest_requires_a_positive_timeout() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        assert!(pool.rest("1.2.3.4:80", 0, None, None).is_err());
        assert!(pool.rest("1.2.3.4:80", 30, None, None).is_ok());
        let proxy = pool.get_by_addr("1.2.3.4:80").unwrap();
        assert!(proxy.rest_till.unwrap() > Utc::now());
    }

    #[test]
    fn blacklist_clears_the_shared_connection_pool_entry() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        let _client = pool.client_for("http://1.2.3.4:80").unwrap();
        assert!(pool.state.lock().pool_manager.contains_key("http://1.2.3.4:80"));
        pool.blacklist("1.2.3.4:80", false);
        assert!(!pool.state.lock().pool_manager.contains_key("http://1.2.3.4:80"));
    }

    #[test]
    fn unblacklist_reinstates_into_active_and_clears_fail() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        pool.blacklist("1.2.3.4:80", false);
        assert!(pool.list_active().is_empty());
        pool.unblacklist("1.2.3.4:80");
        assert_eq!(pool.list_active().len(), 1);
        assert!(pool.list_blacklisted().is_empty());
    }

    #[test]
    fn forget_blacklist_drops_only_entries_older_than_the_cutoff() {
        let pool = pool_with(PoolConfig::default());
        let mut stale = http_proxy("1.2.3.4:80");
        stale.blacklist = true;
        stale.fail_at = Some(Utc::now() - chrono::Duration::days(2));
        pool.proxy(stale, true);

        let mut fresh = http_proxy("5.6.7.8:80");
        fresh.blacklist = true;
        fresh.fail_at = Some(Utc::now());
        pool.proxy(fresh, true);

        let removed = pool.forget_blacklist(Utc::now() - chrono::Duration::days(1));
        assert_eq!(removed, 1);
        assert_eq!(pool.list_blacklisted().len(), 1);
        assert_eq!(pool.list_blacklisted()[0].addr, "5.6.7.8:80");
    }

    #[test]
    fn save_and_load_round_trips_active_and_blacklist_partition() {
        let pool = pool_with(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        let mut blacklisted = http_proxy("5.6.7.8:80");
        blacklisted.blacklist = true;
        pool.proxy(blacklisted, true);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("superproxy-pool-test-{}.json", std::process::id()));
        pool.save(&path).unwrap();

        let reloaded = pool_with(PoolConfig::default());
        reloaded.load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(reloaded.list_active().len(), 1);
        assert_eq!(reloaded.list_blacklisted().len(), 1);
        assert!(reloaded.get_by_addr("1.2.3.4:80").is_some());
        assert!(reloaded.get_by_addr("5.6.7.8:80").is_some());
    }
}
