//! Fetcher orchestrator (spec C5): runs configured scrapers with bounded
//! concurrency, funnels their output into the Checker (if any) and then
//! the Pool.
//!
//! Grounded on `proxytools/proxyfetcher.py`'s `ProxyFetcher`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::checker::Checker;
use crate::config::FetcherConfig;
use crate::model::Proxy;
use crate::pool::{FetcherHandle, ProxyPool};
use crate::scrape::{self, ScraperFilter};

pub struct Fetcher {
    config: FetcherConfig,
    pool: Arc<ProxyPool>,
    checker: Option<Arc<Checker>>,
    filter: ScraperFilter,
    running: AtomicU32,
    started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    trigger_requested: AtomicBool,
    /// Set right after construction so `trigger()` (a `&self` method
    /// called from inside the Pool's mutex-guarded maintenance pass) can
    /// spawn an owned `run()` without the Pool ever holding an `Arc` back
    /// to the Fetcher (spec §9 "cyclic references" note).
    self_handle: OnceLock<Weak<Fetcher>>,
}

impl Fetcher {
    pub fn new(config: FetcherConfig, pool: Arc<ProxyPool>, checker: Option<Arc<Checker>>) -> Arc<Self> {
        let fetcher = Arc::new(Self {
            config,
            pool,
            checker,
            filter: ScraperFilter::default(),
            running: AtomicU32::new(0),
            started_at: parking_lot::Mutex::new(None),
            trigger_requested: AtomicBool::new(false),
            self_handle: OnceLock::new(),
        });
        let _ = fetcher.self_handle.set(Arc::downgrade(&fetcher));
        fetcher
    }

    /// Start every configured scraper in parallel. If `join` is true,
    /// waits for all scrapers, and for the Checker's outstanding work if
    /// one is wired, before returning (spec §4.5 `run(join?)`).
    pub async fn run(self: &Arc<Self>, join: bool) {
        let scrapers = scrape::resolve(&self.config.scrapers);
        if scrapers.is_empty() {
            warn!("fetcher run() with no resolved scrapers");
            return;
        }
        *self.started_at.lock() = Some(Utc::now());

        let fan_out = stream::iter(scrapers.into_iter().map(|scraper| {
            let fetcher = Arc::clone(self);
            async move {
                fetcher.running.fetch_add(1, Ordering::SeqCst);
                let candidates = scrape::run_scraper(scraper.as_ref(), &fetcher.filter).await;
                fetcher.process_candidates(candidates).await;
                fetcher.running.fetch_sub(1, Ordering::SeqCst);
            }
        }))
        .buffer_unordered(self.config.pool_size);

        if join {
            fan_out.for_each(|_| async {}).await;
            if let Some(checker) = &self.checker {
                while !checker.ready() {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        } else {
            tokio::spawn(fan_out.for_each(|_| async {}));
        }
    }

    async fn process_candidates(&self, candidates: Vec<Proxy>) {
        if let Some(checker) = &self.checker {
            for candidate in candidates {
                checker.check(candidate).await;
            }
        } else {
            for candidate in candidates {
                self.pool.proxy(candidate, false);
            }
        }
    }

    /// True iff no scraper is in flight and the checker (if any) is idle.
    pub fn ready(&self) -> bool {
        self.running.load(Ordering::SeqCst) == 0
            && self.checker.as_ref().map(|c| c.ready()).unwrap_or(true)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    /// Explicit scraper registry lookup for admin/status reporting.
    pub fn registry_names(&self) -> Vec<&'static str> {
        scrape::registry().into_iter().map(|(name, _)| name).collect()
    }

    /// One-shot run used by the `fetcher` CLI command: runs to
    /// completion, de-duplicates by addr, and merges meta for
    /// repeat observations across scrapers (`proxyfetcher.py main()`).
    pub async fn run_to_json(self: &Arc<Self>) -> Vec<Proxy> {
        let scrapers = scrape::resolve(&self.config.scrapers);
        let mut merged: HashMap<String, Proxy> = HashMap::new();

        let results: Vec<Vec<Proxy>> = stream::iter(scrapers.into_iter().map(|scraper| {
            let filter = self.filter.clone();
            async move { scrape::run_scraper(scraper.as_ref(), &filter).await }
        }))
        .buffer_unordered(self.config.pool_size)
        .collect()
        .await;

        for batch in results {
            for candidate in batch {
                match merged.get_mut(&candidate.addr) {
                    Some(existing) => existing.merge_meta(&candidate),
                    None => {
                        merged.insert(candidate.addr.clone(), candidate);
                    }
                }
            }
        }

        info!(count = merged.len(), "fetcher run_to_json complete");
        merged.into_values().collect()
    }
}

impl FetcherHandle for Fetcher {
    fn ready(&self) -> bool {
        Fetcher::ready(self)
    }

    /// Trigger an asynchronous, non-blocking fetch cycle (spec §4.2
    /// `maybe_update`). A no-op if one is already pending or in flight.
    fn trigger(&self) {
        if self.trigger_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(weak) = self.self_handle.get() else {
            return;
        };
        let Some(fetcher) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            fetcher.run(true).await;
            fetcher.trigger_requested.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[tokio::test]
    async fn ready_with_no_checker_and_nothing_running() {
        let pool = ProxyPool::new(PoolConfig::default());
        let fetcher = Fetcher::new(FetcherConfig::default(), pool, None);
        assert!(fetcher.ready());
    }
}
