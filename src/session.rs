//! Brokered HTTP session (spec C6): client-side wrapper that, per
//! request, selects a proxy from the Pool, issues the outbound request,
//! interprets the outcome, and releases the proxy.
//!
//! Grounded on `proxytools/requests.py`'s `ProxyListMixin.
//! _proxylist_request` (the retry/classification loop) and
//! `SuperProxySession` (the gateway-calling counterpart).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{header::HeaderMap, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, SuperproxyError};
use crate::pool::{GetOptions, Persist, ProxyPool};

/// A response-classification matcher (spec §6's matcher JSON shape): a
/// response matches iff every configured clause matches. Evaluated by a
/// tiny interpreter — deliberately not arbitrary code (spec design note
/// §9).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMatcher {
    pub status: Option<Vec<u16>>,
    pub status_not: Option<Vec<u16>>,
    pub text: Option<Vec<String>>,
    pub text_not: Option<Vec<String>>,
    pub header: Option<Vec<(String, Option<String>)>>,
    pub header_not: Option<Vec<(String, Option<String>)>>,
}

impl ResponseMatcher {
    pub async fn matches(&self, status: u16, headers: &reqwest::header::HeaderMap, body: &str) -> bool {
        if let Some(allowed) = &self.status {
            if !allowed.contains(&status) {
                return false;
            }
        }
        if let Some(disallowed) = &self.status_not {
            if disallowed.contains(&status) {
                return false;
            }
        }
        if let Some(needles) = &self.text {
            if !needles.iter().any(|n| body.contains(n.as_str())) {
                return false;
            }
        }
        if let Some(needles) = &self.text_not {
            if needles.iter().any(|n| body.contains(n.as_str())) {
                return false;
            }
        }
        if let Some(clauses) = &self.header {
            let all_match = clauses.iter().all(|(name, substr)| {
                headers.get(name.as_str()).and_then(|v| v.to_str().ok()).map_or(false, |v| {
                    substr.as_deref().map(|s| v.contains(s)).unwrap_or(true)
                })
            });
            if !all_match {
                return false;
            }
        }
        if let Some(clauses) = &self.header_not {
            let any_match = clauses.iter().any(|(name, substr)| {
                headers.get(name.as_str()).and_then(|v| v.to_str().ok()).map_or(false, |v| {
                    substr.as_deref().map(|s| v.contains(s)).unwrap_or(true)
                })
            });
            if any_match {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub max_retries: u32,
    pub success_response: Option<ResponseMatcher>,
    pub fail_response: Option<ResponseMatcher>,
    pub rest_response: Option<ResponseMatcher>,
    pub success_timeout: Option<u64>,
    pub fail_timeout: Option<u64>,
    pub rest_timeout: Option<u64>,
    pub allow_no_proxy: bool,
    pub request_ident: Option<String>,
    pub timeout: Option<Duration>,
    /// `X-Superproxy-Proxy-Debug: 1` (spec §6): raises this call's own
    /// retry-loop logging from `debug` to `info`, so one noisy client can
    /// opt into verbose per-attempt logs without raising the whole
    /// process's log level.
    pub debug: bool,
}

/// Outcome of a single brokered request. Carried as plain status/headers/
/// body rather than a `reqwest::Response` because the body has already
/// been buffered for classification (`ResponseMatcher::matches`) by the
/// time a caller sees this — reqwest has no public way to hand back a
/// `Response` built from already-consumed parts.
pub struct BrokeredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The proxy addr that served the request, if any (direct fallthrough
    /// leaves this `None`).
    pub addr: Option<String>,
    pub fail_count: u32,
    pub rest_count: u32,
}

/// The retry/selection loop itself. One instance is typically shared by
/// many callers; `persist` state (the last-successful addr) is scoped to
/// the instance, matching "session-scoped stickiness" in the glossary.
pub struct BrokeredSession {
    pool: Arc<ProxyPool>,
    client: reqwest::Client,
    persist_addr: parking_lot::Mutex<Option<String>>,
    get_opts: GetOptions,
}

impl BrokeredSession {
    pub fn new(pool: Arc<ProxyPool>, get_opts: GetOptions) -> Result<Self> {
        Ok(Self {
            pool,
            client: reqwest::Client::builder().build()?,
            persist_addr: parking_lot::Mutex::new(None),
            get_opts,
        })
    }

    /// Issue `method url`, brokering through the Pool up to
    /// `opts.max_retries` times (spec §4.6). `headers`/`body` are the
    /// caller's original request headers (already stripped of hop-by-hop
    /// headers by [`crate::gateway::headers::strip_hop_by_hop`]) and body,
    /// replayed unchanged on every retry.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        opts: SessionOptions,
    ) -> Result<BrokeredResponse> {
        let max_retries = opts.max_retries.max(1);
        let mut exclude: Vec<String> = self.get_opts.exclude.clone();
        let mut fail_count = 0u32;
        let mut rest_count = 0u32;
        let mut last_reason = "unknown".to_string();

        for attempt in 0..max_retries {
            let mut get_opts = self.get_opts.clone();
            get_opts.exclude = exclude.clone();
            if matches!(get_opts.persist, Persist::Sticky) {
                if let Some(addr) = self.persist_addr.lock().clone() {
                    if !exclude.contains(&addr) {
                        get_opts.persist = Persist::Addr(addr);
                    }
                }
            }

            let proxy = match self.pool.get(get_opts).await {
                Ok(p) => Some(p),
                Err(SuperproxyError::InsufficientProxies(reason)) => {
                    if opts.allow_no_proxy {
                        None
                    } else {
                        return Err(SuperproxyError::InsufficientProxies(reason));
                    }
                }
                Err(other) => return Err(other),
            };

            // reqwest clients are built once per upstream proxy and shared
            // via the pool's connection-pool manager, so every brokered
            // call reuses TCP connections to the same upstream (spec §3/§5)
            // instead of dialing fresh through a per-call builder.
            let client = match &proxy {
                Some(p) => self.pool.client_for(&p.url())?,
                None => std::sync::Arc::new(self.client.clone()),
            };
            let mut request = client
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.clone());
            if let Some(timeout) = opts.timeout {
                request = request.timeout(timeout);
            }
            // never follow redirects through the rotation loop (spec §4.6)
            let outcome = request.send().await;

            let Some(addr) = proxy.as_ref().map(|p| p.addr.clone()) else {
                // direct fallthrough path, no proxy bookkeeping
                let response = outcome?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await?;
                return Ok(BrokeredResponse {
                    status,
                    headers,
                    body,
                    addr: None,
                    fail_count,
                    rest_count,
                });
            };

            match outcome {
                Err(e) => {
                    if opts.debug {
                        info!(addr = %addr, attempt, error = %e, "transport error, failing proxy");
                    } else {
                        debug!(addr = %addr, error = %e, "transport error, failing proxy");
                    }
                    self.pool.fail(&addr, opts.fail_timeout, Some(e.to_string()), opts.request_ident.clone());
                    exclude.push(addr);
                    *self.persist_addr.lock() = None;
                    fail_count += 1;
                    last_reason = "transport error".to_string();
                    continue;
                }
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.bytes().await.unwrap_or_default();
                    let body_text = String::from_utf8_lossy(&body);

                    let is_rest = match &opts.rest_response {
                        Some(m) => m.matches(status.as_u16(), &headers, &body_text).await,
                        None => false,
                    };
                    if is_rest {
                        let timeout = opts.rest_timeout.unwrap_or(60);
                        self.pool.rest(&addr, timeout, Some("rest_response matched".to_string()), opts.request_ident.clone())?;
                        exclude.push(addr);
                        *self.persist_addr.lock() = None;
                        rest_count += 1;
                        last_reason = "rest_response matched".to_string();
                        continue;
                    }

                    let fails = match &opts.fail_response {
                        Some(m) => m.matches(status.as_u16(), &headers, &body_text).await,
                        None => false,
                    };
                    // precedence: fail_response wins over success_response
                    // on overlap (spec §9 open question (c))
                    let succeeds = !fails
                        && match &opts.success_response {
                            Some(m) => m.matches(status.as_u16(), &headers, &body_text).await,
                            None => true,
                        };

                    if succeeds {
                        self.pool.success(&addr, opts.success_timeout, opts.request_ident.clone());
                        if matches!(self.get_opts.persist, Persist::Sticky) {
                            *self.persist_addr.lock() = Some(addr.clone());
                        }
                        info!(addr = %addr, attempt, "brokered request succeeded");
                        return Ok(BrokeredResponse {
                            status,
                            headers,
                            body,
                            addr: Some(addr),
                            fail_count,
                            rest_count,
                        });
                    }

                    if opts.debug {
                        info!(addr = %addr, attempt, %status, "response classified as fail");
                    }
                    self.pool.fail(&addr, opts.fail_timeout, Some(format!("status {status}")), opts.request_ident.clone());
                    exclude.push(addr);
                    *self.persist_addr.lock() = None;
                    fail_count += 1;
                    last_reason = format!("response classified as fail (status {status})");
                }
            }
        }

        Err(SuperproxyError::ProxyMaxRetriesExceeded {
            reason: last_reason,
            fail_count,
            rest_count,
        })
    }
}

/// Client-side helper that talks *to* a superproxy gateway rather than
/// brokering directly (spec §4.7's gateway, grounded on `requests.py`'s
/// `SuperProxySession`). Re-raises `InsufficientProxies`/
/// `ProxyMaxRetriesExceeded` when the gateway names one of those classes
/// in `X-Superproxy-Error`; any other class surfaces as a generic
/// gateway error.
pub struct SuperproxySession {
    client: reqwest::Client,
    gateway_base: String,
}

impl SuperproxySession {
    pub fn new(gateway_base: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            gateway_base: gateway_base.into(),
        })
    }

    pub async fn request(&self, method: Method, url: &str) -> Result<Response> {
        let response = self
            .client
            .request(method, url)
            .header("Host", &self.gateway_base)
            .send()
            .await?;

        if response.status().is_server_error() {
            let error_class = response
                .headers()
                .get("X-Superproxy-Error")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("InternalError")
                .to_string();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(classify_gateway_error(&error_class, &body));
        }
        Ok(response)
    }
}

fn classify_gateway_error(class: &str, body: &Value) -> SuperproxyError {
    let args = body.as_array().cloned().unwrap_or_default();
    match class {
        "InsufficientProxies" => SuperproxyError::InsufficientProxies(
            args.get(1).and_then(|v| v.as_str()).unwrap_or("insufficient proxies").to_string(),
        ),
        "ProxyMaxRetriesExceeded" => SuperproxyError::ProxyMaxRetriesExceeded {
            reason: args.get(1).and_then(|v| v.as_str()).unwrap_or("retries exceeded").to_string(),
            fail_count: args.get(2).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            rest_count: args.get(3).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        },
        other => SuperproxyError::Internal(format!("gateway error: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matcher_status_and_text_clauses() {
        let matcher = ResponseMatcher {
            status: Some(vec![503]),
            text: Some(vec!["rate limit".to_string()]),
            ..Default::default()
        };
        let headers = reqwest::header::HeaderMap::new();
        assert!(matcher.matches(503, &headers, "rate limit exceeded").await);
        assert!(!matcher.matches(503, &headers, "ok").await);
        assert!(!matcher.matches(500, &headers, "rate limit exceeded").await);
    }

    #[test]
    fn classifies_known_gateway_error_classes() {
        let body = serde_json::json!(["InsufficientProxies", "no ready proxy"]);
        match classify_gateway_error("InsufficientProxies", &body) {
            SuperproxyError::InsufficientProxies(reason) => assert_eq!(reason, "no ready proxy"),
            _ => panic!("expected InsufficientProxies"),
        }
    }

    /// Spins up a throwaway local HTTP server and drives a real
    /// `BrokeredSession::request` against it end-to-end (direct
    /// fallthrough, no upstream proxy involved) to exercise outcome
    /// classification against an actual socket rather than a mocked
    /// `reqwest::Response`.
    async fn spawn_test_server(status: u16, body: &'static str) -> String {
        use axum::routing::get;

        let status = axum::http::StatusCode::from_u16(status).unwrap();
        let app = axum::Router::new().route("/", get(move || async move { (status, body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn direct_fallthrough_returns_the_live_server_response_when_pool_is_empty() {
        let pool = crate::pool::ProxyPool::new(crate::config::PoolConfig::default());
        let session = BrokeredSession::new(pool, GetOptions::default()).unwrap();
        let url = spawn_test_server(200, "hello from test server").await;

        let response = session
            .request(
                Method::GET,
                &url,
                HeaderMap::new(),
                Bytes::new(),
                SessionOptions {
                    max_retries: 1,
                    allow_no_proxy: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"hello from test server"));
        assert!(response.addr.is_none());
    }

    #[tokio::test]
    async fn propagates_insufficient_proxies_when_pool_is_empty_and_no_fallthrough_allowed() {
        let pool = crate::pool::ProxyPool::new(crate::config::PoolConfig::default());
        let session = BrokeredSession::new(pool, GetOptions::default()).unwrap();
        let url = spawn_test_server(200, "unreachable without a proxy").await;

        let err = session
            .request(
                Method::GET,
                &url,
                HeaderMap::new(),
                Bytes::new(),
                SessionOptions {
                    max_retries: 1,
                    allow_no_proxy: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SuperproxyError::InsufficientProxies(_)));
    }
}
