use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::warn;

use super::session::SessionDefaults;
use super::Scraper;
use crate::model::{Proxy, ProxyType};

/// Regex-driven scraper over a simple `addr<TAB>type<TAB>country` text
/// export, grounded on the form-post/free-text shape of
/// `proxytools/fetchers/spysone.py`. Most public SOCKS listing sites
/// offer this kind of plain-text export alongside an HTML page; parsing
/// it avoids the session/cookie/form-token dance the HTML page requires,
/// which is exactly why the Python source reaches for it too.
pub struct SpysOneScraper {
    session: SessionDefaults,
    url: String,
}

impl SpysOneScraper {
    pub const NAME: &'static str = "spysone";

    pub fn new() -> Self {
        Self {
            session: SessionDefaults::default(),
            url: "https://spys.one/en/socks-proxy-list/".to_string(),
        }
    }
}

impl Default for SpysOneScraper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scraper for SpysOneScraper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn scrape(&self) -> Vec<Proxy> {
        let client = match self.session.build_client() {
            Ok(c) => c,
            Err(e) => {
                warn!(scraper = Self::NAME, error = %e, "failed to build http client");
                return Vec::new();
            }
        };
        let body = match self.session.get_with_retry(&client, &self.url).await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(scraper = Self::NAME, error = %e, "failed to read response body");
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!(scraper = Self::NAME, error = %e, "request failed");
                return Vec::new();
            }
        };
        parse_lines(&body)
    }
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(\d{1,3}(?:\.\d{1,3}){3}:\d{1,5})\s+(SOCKS4|SOCKS5)\s+([A-Z]{2})$")
            .expect("static regex is valid")
    })
}

fn parse_lines(body: &str) -> Vec<Proxy> {
    let mut out = Vec::new();
    for caps in entry_re().captures_iter(body) {
        let addr = caps[1].to_string();
        let proxy_type = match &caps[2] {
            "SOCKS4" => ProxyType::Socks4,
            _ => ProxyType::Socks5,
        };
        let country = caps[3].to_string();

        let Ok(mut proxy) = Proxy::new(addr, HashSet::from([proxy_type])) else {
            continue;
        };
        proxy.country = Some(country);
        proxy.fetch_at = Some(Utc::now());
        out.push(proxy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socks_lines() {
        let body = "noise before\n1.2.3.4:1080 SOCKS5 DE\n5.6.7.8:1081 SOCKS4 FR\ntrailing noise";
        let proxies = parse_lines(body);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].addr, "1.2.3.4:1080");
        assert!(proxies[0].types.contains(&ProxyType::Socks5));
        assert_eq!(proxies[1].country.as_deref(), Some("FR"));
    }
}
