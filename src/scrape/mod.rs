//! Scraper framework (spec C4): the contract between the Fetcher
//! orchestrator and the (external-collaborator) parsers for individual
//! proxy-listing sites, plus an explicit registry and two worked-example
//! scrapers proving out both parser shapes (HTML table, JSON/regex).
//!
//! Grounded on `proxytools/proxyfetcher.py`'s `ConcreteProxyFetcher` and
//! `fetchers/__init__.py`'s dynamic-module-scan registry — replaced here,
//! per spec design note §9, with an explicit build-time registry.

mod freeproxylist;
mod session;
mod spysone;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::{Anonymity, Proxy, ProxyType};

pub use session::SessionDefaults;

/// Post-filter applied uniformly to every scraper's output before
/// emission (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct ScraperFilter {
    pub countries: Vec<String>,
    pub anonymities: Vec<Anonymity>,
    pub types: HashSet<ProxyType>,
    pub success_delta: Option<chrono::Duration>,
}

impl ScraperFilter {
    pub fn passes(&self, p: &Proxy, now: DateTime<Utc>) -> bool {
        if !self.countries.is_empty() {
            let ok = p
                .country
                .as_deref()
                .map(|c| self.countries.iter().any(|w| w == c))
                .unwrap_or(false);
            if !ok {
                return false;
            }
        }
        if !self.anonymities.is_empty() {
            let ok = p
                .anonymity
                .map(|a| self.anonymities.contains(&a))
                .unwrap_or(false);
            if !ok {
                return false;
            }
        }
        if !self.types.is_empty() && p.types.is_disjoint(&self.types) {
            return false;
        }
        if let Some(delta) = self.success_delta {
            match p.success_at {
                Some(t) if t >= now - delta => {}
                _ => return false,
            }
        }
        true
    }
}

/// A single external proxy-listing source. Implementations yield
/// well-formed `Proxy` candidates; they must not maintain global state,
/// and a failure inside one scraper is logged and does not abort others
/// (spec §4.4).
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Lowercase, stable identifier used for registration and
    /// `fetch_sources` tagging.
    fn name(&self) -> &'static str;

    /// Produce this run's candidate proxies. Internally a scraper may
    /// fan out sub-workers (pagination, per-country pages) under its own
    /// bounded concurrency; the orchestrator only awaits the overall
    /// future.
    async fn scrape(&self) -> Vec<Proxy>;
}

/// Converts a listing site's relative freshness text (e.g. `"5 minutes
/// ago"`, `"1 hour ago"`) into an absolute timestamp anchored at `now`
/// (spec §4.4: "relative success_at values... are converted to absolute
/// timestamps at emission time"). Returns `None` for text it doesn't
/// recognise rather than guessing.
pub fn parse_relative_seconds_ago(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim().to_lowercase();
    let text = text.strip_suffix(" ago").unwrap_or(&text);
    let mut parts = text.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.trim_end_matches('s');
    let delta = match unit {
        "second" | "sec" => chrono::Duration::seconds(amount),
        "minute" | "min" => chrono::Duration::minutes(amount),
        "hour" | "hr" => chrono::Duration::hours(amount),
        "day" => chrono::Duration::days(amount),
        _ => return None,
    };
    Some(now - delta)
}

/// Wraps a scraper's raw output with the uniform post-filter and
/// `fetch_at`/`fetch_sources` stamping (spec §4.4).
pub async fn run_scraper(scraper: &dyn Scraper, filter: &ScraperFilter) -> Vec<Proxy> {
    let now = Utc::now();
    let mut out = Vec::new();
    for mut candidate in scraper.scrape().await {
        if !filter.passes(&candidate, now) {
            continue;
        }
        candidate.fetch_at = Some(now);
        candidate.fetch_sources.insert(scraper.name().to_string());
        if let Some(success_at) = candidate.success_at {
            if success_at > now {
                warn!(
                    scraper = scraper.name(),
                    addr = %candidate.addr,
                    "dropping candidate whose success_at is in the future"
                );
                continue;
            }
        }
        out.push(candidate);
    }
    out
}

/// Explicit scraper registry (spec design note §9): each scraper
/// registers a constructor under its name; lookup is a plain map.
pub fn registry() -> Vec<(&'static str, Arc<dyn Scraper>)> {
    vec![
        (
            freeproxylist::FreeProxyListScraper::NAME,
            Arc::new(freeproxylist::FreeProxyListScraper::new()) as Arc<dyn Scraper>,
        ),
        (
            spysone::SpysOneScraper::NAME,
            Arc::new(spysone::SpysOneScraper::new()) as Arc<dyn Scraper>,
        ),
    ]
}

pub fn resolve(names: &[String]) -> Vec<Arc<dyn Scraper>> {
    let all = registry();
    if names.iter().any(|n| n == "*") {
        return all.into_iter().map(|(_, s)| s).collect();
    }
    names
        .iter()
        .filter_map(|name| {
            all.iter()
                .find(|(registered, _)| registered == name)
                .map(|(_, s)| Arc::clone(s))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_time_parses_common_units() {
        let now = Utc::now();
        let five_min = parse_relative_seconds_ago("5 minutes ago", now).unwrap();
        assert_eq!((now - five_min).num_minutes(), 5);
        let one_hour = parse_relative_seconds_ago("1 hour ago", now).unwrap();
        assert_eq!((now - one_hour).num_hours(), 1);
        assert!(parse_relative_seconds_ago("just now", now).is_none());
    }

    #[test]
    fn resolve_star_returns_every_registered_scraper() {
        let all = registry();
        let resolved = resolve(&["*".to_string()]);
        assert_eq!(resolved.len(), all.len());
    }
}
