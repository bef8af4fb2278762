use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::history::{push_bounded, HistoryEntry, HistoryKind};
use crate::error::{Result, SuperproxyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    fn is_http_family(self) -> bool {
        matches!(self, ProxyType::Http | ProxyType::Https)
    }

    fn is_socks_family(self) -> bool {
        matches!(self, ProxyType::Socks4 | ProxyType::Socks5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Anonymity {
    High,
    Anonymous,
    Transparent,
}

/// Identity, health state, and history for one remote proxy.
///
/// Invariants (spec §3 / §8):
/// - `types` is non-empty and either a subset of `{Http, Https}` or of
///   `{Socks4, Socks5}`, never mixed.
/// - if `Http` is not in `types`, `anonymity` is forced to `High`.
/// - `0 <= in_use` (the pool enforces the `<= max_simultaneous` half).
/// - `rest_till` only advances while a reason is active (`set_rest_till`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub addr: String,
    pub types: HashSet<ProxyType>,
    pub anonymity: Option<Anonymity>,
    pub country: Option<String>,
    pub speed: Option<f64>,
    pub fetch_at: Option<DateTime<Utc>>,
    pub fetch_sources: HashSet<String>,
    pub success_at: Option<DateTime<Utc>>,
    pub fail_at: Option<DateTime<Utc>>,
    pub fail: u32,
    pub in_use: u32,
    pub rest_till: Option<DateTime<Utc>>,
    pub blacklist: bool,
    pub history: VecDeque<HistoryEntry>,
}

impl Proxy {
    /// Construct a new proxy record, normalising `types` and the
    /// HTTP-family anonymity invariant. Fails if `types` is empty or mixes
    /// HTTP-family and SOCKS-family members.
    pub fn new(addr: impl Into<String>, types: HashSet<ProxyType>) -> Result<Self> {
        if types.is_empty() {
            return Err(SuperproxyError::InvalidProxyAddress(
                "proxy must have at least one type".to_string(),
            ));
        }
        let http_family = types.iter().any(|t| t.is_http_family());
        let socks_family = types.iter().any(|t| t.is_socks_family());
        if http_family && socks_family {
            return Err(SuperproxyError::InvalidProxyAddress(
                "proxy types must not mix HTTP-family and SOCKS-family".to_string(),
            ));
        }

        let anonymity = if types.contains(&ProxyType::Http) {
            None
        } else {
            Some(Anonymity::High)
        };

        Ok(Self {
            addr: addr.into(),
            types,
            anonymity,
            country: None,
            speed: None,
            fetch_at: None,
            fetch_sources: HashSet::new(),
            success_at: None,
            fail_at: None,
            fail: 0,
            in_use: 0,
            rest_till: None,
            blacklist: false,
            history: VecDeque::new(),
        })
    }

    /// `scheme://addr`: HTTP for http-family, SOCKS5 for socks-family
    /// (SOCKS4 is also rendered as `socks5` in the transport URL; the
    /// original type is preserved in `types`).
    pub fn url(&self) -> String {
        let scheme = if self.types.iter().any(|t| t.is_http_family()) {
            "http"
        } else {
            "socks5"
        };
        format!("{scheme}://{}", self.addr)
    }

    pub fn used_at(&self) -> Option<DateTime<Utc>> {
        match (self.success_at, self.fail_at) {
            (Some(s), Some(f)) => Some(s.max(f)),
            (Some(s), None) => Some(s),
            (None, Some(f)) => Some(f),
            (None, None) => None,
        }
    }

    pub fn is_checked(&self) -> bool {
        match (self.success_at, self.fetch_at) {
            (Some(s), Some(f)) => s > f,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn is_http_family(&self) -> bool {
        self.types.iter().any(|t| t.is_http_family())
    }

    /// Merge a freshly-observed record's metadata into `self`. Cross-family
    /// merges (HTTP-family vs SOCKS-family) are ignored entirely. Within a
    /// family, type sets and fetch_sources are unioned; country,
    /// anonymity, and speed are filled only where currently absent — never
    /// overwrites a set field.
    pub fn merge_meta(&mut self, other: &Proxy) {
        if self.is_http_family() != other.is_http_family() {
            return;
        }
        self.types.extend(other.types.iter().copied());
        self.fetch_sources
            .extend(other.fetch_sources.iter().cloned());
        if self.country.is_none() {
            self.country = other.country.clone();
        }
        if self.anonymity.is_none() {
            self.anonymity = other.anonymity;
        }
        if self.speed.is_none() {
            self.speed = other.speed;
        }
    }

    pub fn set_history(
        &mut self,
        time: DateTime<Utc>,
        kind: HistoryKind,
        reason: Option<String>,
        request_ident: Option<String>,
        max: usize,
    ) {
        push_bounded(
            &mut self.history,
            HistoryEntry {
                time,
                kind,
                reason,
                request_ident,
            },
            max,
        );
    }

    /// Monotonically advance `rest_till`; never rolls it back.
    pub fn set_rest_till(&mut self, t: DateTime<Utc>) {
        self.rest_till = Some(match self.rest_till {
            Some(existing) => existing.max(t),
            None => t,
        });
    }

    pub fn is_resting(&self, now: DateTime<Utc>) -> bool {
        self.rest_till.map(|t| t > now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_proxy(addr: &str) -> Proxy {
        Proxy::new(addr, HashSet::from([ProxyType::Http])).unwrap()
    }

    #[test]
    fn rejects_mixed_families() {
        let types = HashSet::from([ProxyType::Http, ProxyType::Socks5]);
        assert!(Proxy::new("1.2.3.4:80", types).is_err());
    }

    #[test]
    fn non_http_forces_high_anonymity() {
        let p = Proxy::new("1.2.3.4:1080", HashSet::from([ProxyType::Socks5])).unwrap();
        assert_eq!(p.anonymity, Some(Anonymity::High));
    }

    #[test]
    fn url_renders_socks4_as_socks5() {
        let p = Proxy::new("1.2.3.4:1080", HashSet::from([ProxyType::Socks4])).unwrap();
        assert_eq!(p.url(), "socks5://1.2.3.4:1080");
        assert!(p.types.contains(&ProxyType::Socks4));
    }

    #[test]
    fn merge_meta_unions_within_family_and_fills_absent_fields() {
        let mut a = http_proxy("1.2.3.4:80");
        a.country = Some("US".to_string());
        let mut b = http_proxy("1.2.3.4:80");
        b.types.insert(ProxyType::Https);
        b.speed = Some(42.0);
        b.country = Some("DE".to_string());
        b.fetch_sources.insert("spysone".to_string());

        a.merge_meta(&b);

        assert!(a.types.contains(&ProxyType::Https));
        assert_eq!(a.country.as_deref(), Some("US")); // not overwritten
        assert_eq!(a.speed, Some(42.0)); // filled, was absent
        assert!(a.fetch_sources.contains("spysone"));
    }

    #[test]
    fn merge_meta_ignores_cross_family() {
        let mut a = http_proxy("1.2.3.4:80");
        let socks = Proxy::new("1.2.3.4:80", HashSet::from([ProxyType::Socks5])).unwrap();
        a.merge_meta(&socks);
        assert!(!a.types.contains(&ProxyType::Socks5));
    }

    #[test]
    fn set_rest_till_never_rolls_back() {
        let mut p = http_proxy("1.2.3.4:80");
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(60);
        p.set_rest_till(t2);
        p.set_rest_till(t1);
        assert_eq!(p.rest_till, Some(t2));
    }

    #[test]
    fn json_round_trip_is_equivalent() {
        let mut p = http_proxy("1.2.3.4:80");
        p.country = Some("US".to_string());
        p.speed = Some(12.5);
        p.fetch_sources.insert("freeproxylistnet".to_string());

        let json = serde_json::to_string(&p).unwrap();
        let reloaded: Proxy = serde_json::from_str(&json).unwrap();

        assert_eq!(reloaded.addr, p.addr);
        assert_eq!(reloaded.types, p.types);
        assert_eq!(reloaded.country, p.country);
        assert_eq!(reloaded.speed, p.speed);
        assert_eq!(reloaded.fetch_sources, p.fetch_sources);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut p = http_proxy("1.2.3.4:80");
        for _ in 0..5 {
            p.set_history(Utc::now(), HistoryKind::Success, None, None, 3);
        }
        assert_eq!(p.history.len(), 3);
    }
}
