use std::time::Duration;

use crate::error::Result;

/// Sensible session defaults every scraper starts from (spec §4.4;
/// grounded on `requests.py ConfigurableSession` and
/// `proxyfetcher.py ConcreteProxyFetcher.create_session`): a realistic
/// desktop user-agent, connect/read timeouts, and optional per-source
/// throttling between consecutive requests from the same worker.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub user_agent: String,
    pub timeout: Duration,
    pub request_wait: Option<Duration>,
    /// Response statuses worth retrying once (e.g. a listing site's own
    /// rate-limit page), distinct from the Pool's proxy-health retry logic
    /// — this is the scraper's own HTTP client retrying its one upstream
    /// request, not a proxy rotation.
    pub retry_statuses: Vec<u16>,
    pub retry_wait: Duration,
    pub max_retries: u32,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            timeout: Duration::from_secs(15),
            request_wait: None,
            retry_statuses: vec![429, 503],
            retry_wait: Duration::from_secs(2),
            max_retries: 2,
        }
    }
}

impl SessionDefaults {
    pub fn build_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .build()?)
    }

    /// Sleep between paginated requests issued by the same scraper
    /// worker, if throttling is configured.
    pub async fn throttle(&self) {
        if let Some(wait) = self.request_wait {
            tokio::time::sleep(wait).await;
        }
    }

    /// `GET url`, retrying once per configured `retry_statuses` member
    /// encountered, waiting `retry_wait` between attempts (spec §4.4:
    /// "optional per-source request throttling and retry-on-specific-
    /// responses").
    pub async fn get_with_retry(&self, client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let response = client.get(url).send().await?;
            if attempt < self.max_retries && self.retry_statuses.contains(&response.status().as_u16()) {
                attempt += 1;
                tokio::time::sleep(self.retry_wait).await;
                continue;
            }
            return Ok(response);
        }
    }
}
