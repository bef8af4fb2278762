use std::time::Duration as StdDuration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::debug;

use super::{PoolState, ProxyPool, WaitingEntry};
use crate::error::{Result, SuperproxyError};
use crate::model::Proxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Random,
    Fastest,
}

#[derive(Debug, Clone, Default)]
pub enum Persist {
    #[default]
    None,
    /// Use this session's last-successful addr, if still ready.
    Sticky,
    Addr(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Wait {
    No,
    Yes,
    Seconds(u64),
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub strategy: Strategy,
    pub persist: Persist,
    pub wait: Option<Wait>,
    pub request_ident: Option<String>,
    pub exclude: Vec<String>,
    pub countries: Vec<String>,
    pub countries_exclude: Vec<String>,
    pub min_speed: Option<f64>,
}

impl Default for Wait {
    fn default() -> Self {
        Wait::Yes
    }
}

fn is_ready(p: &Proxy, now: chrono::DateTime<Utc>, opts: &GetOptions, max_simultaneous: u32) -> bool {
    if p.in_use >= max_simultaneous {
        return false;
    }
    if opts.exclude.iter().any(|a| a == &p.addr) {
        return false;
    }
    if p.is_resting(now) {
        return false;
    }
    if !opts.countries.is_empty() {
        let matches = p
            .country
            .as_deref()
            .map(|c| opts.countries.iter().any(|w| w == c))
            .unwrap_or(false);
        if !matches {
            return false;
        }
    }
    if !opts.countries_exclude.is_empty() {
        if let Some(c) = p.country.as_deref() {
            if opts.countries_exclude.iter().any(|w| w == c) {
                return false;
            }
        }
    }
    if let Some(min_speed) = opts.min_speed {
        if p.speed.map(|s| s < min_speed).unwrap_or(true) {
            return false;
        }
    }
    true
}

fn pick<'a>(ready: &'a [&'a Proxy], opts: &GetOptions) -> &'a Proxy {
    let persisted_addr = match &opts.persist {
        Persist::Addr(addr) => Some(addr.as_str()),
        _ => None,
    };
    if let Some(addr) = persisted_addr {
        if let Some(p) = ready.iter().find(|p| p.addr == addr) {
            return p;
        }
    }
    match opts.strategy {
        Strategy::Random => {
            let mut rng = rand::thread_rng();
            ready.choose(&mut rng).expect("ready is non-empty")
        }
        Strategy::Fastest => ready
            .iter()
            .max_by(|a, b| {
                let score = |p: &Proxy| p.speed.unwrap_or(0.0) / (p.in_use as f64 + 1.0);
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("ready is non-empty"),
    }
}

impl ProxyPool {
    /// The core selection entry point (spec §4.2 `get`).
    pub async fn get(&self, mut opts: GetOptions) -> Result<Proxy> {
        {
            let state = self.state.lock();
            let fetcher_present = self.fetcher.lock().is_some();
            if state.active.is_empty() && !fetcher_present {
                return Err(SuperproxyError::InsufficientProxies(
                    "no active proxies and no fetcher configured".to_string(),
                ));
            }
        }

        self.maybe_update(Utc::now());

        let wait = opts.wait.take().unwrap_or_default();
        let wait_seconds = match wait {
            Wait::No => None,
            Wait::Yes => Some(u64::MAX),
            Wait::Seconds(s) => Some(s),
        };

        let deadline = wait_seconds.map(|s| {
            tokio::time::Instant::now()
                + StdDuration::from_secs(s.min(60 * 60 * 24 * 365))
        });

        let mut waiter_id: Option<u64> = None;
        let result = loop {
            // Register intent to be notified *before* re-checking
            // eligibility: `Notify::notify_waiters` does not buffer a
            // permit, so a notification fired in the gap between reading
            // `state` and awaiting `notified` would otherwise be lost,
            // stalling a `Wait::Yes` waiter past the moment a proxy
            // actually became available (spec §5: waiters must not
            // deadlock). Creating the future here, ahead of the
            // eligibility test, is tokio's documented safe pattern for
            // condition-loops over `Notify`.
            let notified = self.available.notified();
            tokio::pin!(notified);

            let selected = {
                let mut state = self.state.lock();
                let now = Utc::now();
                let ready: Vec<&Proxy> = state
                    .active
                    .values()
                    .filter(|p| is_ready(p, now, &opts, self.config.max_simultaneous))
                    .collect();

                if ready.is_empty() {
                    None
                } else {
                    let addr = pick(&ready, &opts).addr.clone();
                    let proxy = state.active.get_mut(&addr).unwrap();
                    proxy.in_use += 1;
                    Some(proxy.clone())
                }
            };

            if let Some(proxy) = selected {
                if let Some(id) = waiter_id.take() {
                    self.state.lock().waiting.remove(&id);
                }
                break Ok(proxy);
            }

            let total_in_use: u32 = self.state.lock().active.values().map(|p| p.in_use).sum();
            let fetcher_idle = self
                .fetcher
                .lock()
                .as_ref()
                .map(|f| f.ready())
                .unwrap_or(true);

            if wait_seconds.is_none() || (fetcher_idle && total_in_use == 0) {
                if let Some(id) = waiter_id.take() {
                    self.state.lock().waiting.remove(&id);
                }
                break Err(SuperproxyError::InsufficientProxies(
                    "no ready proxy and not waiting".to_string(),
                ));
            }

            if waiter_id.is_none() {
                let id = self.next_waiter_id();
                self.register_waiter(id, &opts);
                waiter_id = Some(id);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, &mut notified).await.is_err() {
                        self.state.lock().waiting.remove(&waiter_id.unwrap());
                        debug!("get(): wait budget exceeded");
                        break Err(SuperproxyError::InsufficientProxies(
                            "timed out waiting for a ready proxy".to_string(),
                        ));
                    }
                }
                None => notified.await,
            }
        };

        if let Some(id) = waiter_id {
            self.state.lock().waiting.remove(&id);
        }
        result
    }

    fn register_waiter(&self, id: u64, opts: &GetOptions) {
        let params = format!(
            "strategy={:?} countries={:?} countries_exclude={:?} min_speed={:?}",
            opts.strategy, opts.countries, opts.countries_exclude, opts.min_speed
        );
        self.state.lock().waiting.insert(
            id,
            WaitingEntry {
                since: Utc::now(),
                request_ident: opts.request_ident.clone(),
                params,
            },
        );
    }
}

pub(crate) fn smallest_future_rest_till(state: &PoolState) -> Option<chrono::DateTime<Utc>> {
    state.active.values().filter_map(|p| p.rest_till).min()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusCounters {
    pub active: usize,
    pub resting: usize,
    pub blacklisted: usize,
    pub in_use: u32,
    pub waiting: usize,
    pub need_update: bool,
    pub started_at: chrono::DateTime<Utc>,
    pub updated_at: Option<chrono::DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::model::{Proxy, ProxyType};
    use std::collections::HashSet as Set;

    fn http_proxy(addr: &str) -> Proxy {
        Proxy::new(addr, Set::from([ProxyType::Http])).unwrap()
    }

    #[tokio::test]
    async fn get_returns_insufficient_proxies_with_no_active_and_no_fetcher() {
        let pool = ProxyPool::new(PoolConfig::default());
        let err = pool.get(GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, SuperproxyError::InsufficientProxies(_)));
    }

    #[tokio::test]
    async fn get_increments_in_use_and_enforces_max_simultaneous() {
        let mut config = PoolConfig::default();
        config.max_simultaneous = 1;
        let pool = ProxyPool::new(config);
        pool.proxy(http_proxy("1.2.3.4:80"), false);

        let first = pool.get(GetOptions::default()).await.unwrap();
        assert_eq!(first.in_use, 1);

        let opts = GetOptions {
            wait: Some(Wait::No),
            ..Default::default()
        };
        let err = pool.get(opts).await.unwrap_err();
        assert!(matches!(err, SuperproxyError::InsufficientProxies(_)));
    }

    #[tokio::test]
    async fn get_honours_exclude_even_when_addr_is_persisted() {
        let pool = ProxyPool::new(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        pool.proxy(http_proxy("5.6.7.8:80"), false);

        let opts = GetOptions {
            persist: Persist::Addr("1.2.3.4:80".to_string()),
            exclude: vec!["1.2.3.4:80".to_string()],
            wait: Some(Wait::No),
            ..Default::default()
        };
        let selected = pool.get(opts).await.unwrap();
        assert_eq!(selected.addr, "5.6.7.8:80");
    }

    #[tokio::test]
    async fn get_filters_by_country_allow_list() {
        let pool = ProxyPool::new(PoolConfig::default());
        let mut us = http_proxy("1.2.3.4:80");
        us.country = Some("US".to_string());
        pool.proxy(us, false);
        let mut fr = http_proxy("5.6.7.8:80");
        fr.country = Some("FR".to_string());
        pool.proxy(fr, false);

        let opts = GetOptions {
            countries: vec!["US".to_string()],
            wait: Some(Wait::No),
            ..Default::default()
        };
        let selected = pool.get(opts).await.unwrap();
        assert_eq!(selected.addr, "1.2.3.4:80");
    }

    #[tokio::test]
    async fn get_wait_seconds_times_out_while_all_proxies_rest() {
        let pool = ProxyPool::new(PoolConfig::default());
        pool.proxy(http_proxy("1.2.3.4:80"), false);
        pool.rest("1.2.3.4:80", 60, None, None).unwrap();

        let started = std::time::Instant::now();
        let opts = GetOptions {
            wait: Some(Wait::Seconds(1)),
            ..Default::default()
        };
        let err = pool.get(opts).await.unwrap_err();
        assert!(matches!(err, SuperproxyError::InsufficientProxies(_)));
        assert!(started.elapsed() >= StdDuration::from_millis(900));
    }

    #[tokio::test]
    async fn fastest_strategy_prefers_higher_speed_per_load() {
        let pool = ProxyPool::new(PoolConfig::default());
        let mut slow = http_proxy("1.2.3.4:80");
        slow.speed = Some(10.0);
        pool.proxy(slow, false);
        let mut fast = http_proxy("5.6.7.8:80");
        fast.speed = Some(1000.0);
        pool.proxy(fast, false);

        let opts = GetOptions {
            strategy: Strategy::Fastest,
            wait: Some(Wait::No),
            ..Default::default()
        };
        let selected = pool.get(opts).await.unwrap();
        assert_eq!(selected.addr, "5.6.7.8:80");
    }
}
