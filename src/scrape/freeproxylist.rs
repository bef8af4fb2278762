use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use tracing::warn;

use super::session::SessionDefaults;
use super::Scraper;
use crate::model::{Anonymity, Proxy, ProxyType};

/// HTML-table scraper, grounded on the shape of
/// `proxytools/fetchers/freeproxylistnet.py`: a single page whose proxy
/// list is one `<table>` with `ip`/`port`/`country`/`anonymity` columns.
pub struct FreeProxyListScraper {
    session: SessionDefaults,
    url: String,
}

impl FreeProxyListScraper {
    pub const NAME: &'static str = "freeproxylistnet";

    pub fn new() -> Self {
        Self {
            session: SessionDefaults::default(),
            url: "https://free-proxy-list.net/".to_string(),
        }
    }
}

impl Default for FreeProxyListScraper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scraper for FreeProxyListScraper {
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

        parse_table(&body)
    }
}

fn parse_table(html: &str) -> Vec<Proxy> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse("table tbody tr").unwrap();
    let cell_selector = Selector::parse("td").unwrap();

    let mut out = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        // ip, port, country_code, country, anonymity, google, https, last_checked
        if cells.len() < 8 {
            continue;
        }
        let addr = format!("{}:{}", cells[0], cells[1]);
        let country = Some(cells[2].to_uppercase()).filter(|c| c.len() == 2);
        let anonymity = match cells[4].to_lowercase().as_str() {
            "elite proxy" => Some(Anonymity::High),
            "anonymous" => Some(Anonymity::Anonymous),
            _ => Some(Anonymity::Transparent),
        };
        let https_capable = cells[6].eq_ignore_ascii_case("yes");

        let mut types = HashSet::from([ProxyType::Http]);
        if https_capable {
            types.insert(ProxyType::Https);
        }

        let Ok(mut proxy) = Proxy::new(addr, types) else {
            continue;
        };
        proxy.country = country;
        if proxy.anonymity.is_none() {
            proxy.anonymity = anonymity;
        }
        let now = Utc::now();
        proxy.success_at = super::parse_relative_seconds_ago(&cells[7], now);
        proxy.fetch_at = Some(now);
        out.push(proxy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_table() {
        let html = r#"
            <table><tbody>
                <tr>
                    <td>1.2.3.4</td><td>8080</td><td>US</td><td>United States</td>
                    <td>elite proxy</td><td>no</td><td>yes</td><td>1 minute ago</td>
                </tr>
            </tbody></table>
        "#;
        let proxies = parse_table(html);
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].addr, "1.2.3.4:8080");
        assert_eq!(proxies[0].country.as_deref(), Some("US"));
        assert!(proxies[0].types.contains(&ProxyType::Https));
    }

    #[test]
    fn skips_malformed_rows() {
        let html = "<table><tbody><tr><td>only</td><td>two</td></tr></tbody></table>";
        assert!(parse_table(html).is_empty());
    }
}
