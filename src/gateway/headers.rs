//! `X-Superproxy-*` header codec (spec §6 / §4.7).
//!
//! Decodes the inbound policy headers into overrides for [`GetOptions`]/
//! [`SessionOptions`], and strips hop-by-hop + `X-Superproxy-*` headers on
//! both legs of the brokered call.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::pool::{GetOptions, Persist, Strategy, Wait};
use crate::session::{ResponseMatcher, SessionOptions};

/// Hop-by-hop headers stripped between proxy legs (spec glossary).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-encoding",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("x-superproxy-")
}

/// Build an outbound header map from an inbound one, stripping hop-by-hop
/// and `X-Superproxy-*` headers (spec §4.7's "collect inbound request
/// headers, stripping...").
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn decode_matcher(encoded: &str) -> Option<ResponseMatcher> {
    let decoded = urlencoding_decode(encoded);
    serde_json::from_str(&decoded).ok()
}

/// Minimal percent-decoder; the matcher JSON travels URL-encoded in a
/// header value (spec §6).
fn urlencoding_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decoded request-scoped policy overrides (spec §6 table).
#[derive(Debug, Default)]
pub struct PolicyHeaders {
    pub get_opts: GetOptions,
    pub session_opts: SessionOptions,
    pub debug: bool,
}

/// Decode the full `X-Superproxy-*` header set (spec §6). Unknown values
/// for a header are ignored (the default for that knob is kept), rather
/// than rejecting the whole request.
pub fn decode(headers: &HeaderMap, default_max_retries: u32, default_timeout_secs: u64) -> PolicyHeaders {
    let mut get_opts = GetOptions::default();
    let mut session_opts = SessionOptions {
        max_retries: default_max_retries,
        timeout: Some(std::time::Duration::from_secs(default_timeout_secs)),
        ..Default::default()
    };

    if let Some(v) = header_str(headers, "x-superproxy-timeout").and_then(|v| v.parse::<u64>().ok()) {
        session_opts.timeout = Some(std::time::Duration::from_secs(v));
    }
    if let Some(v) = header_str(headers, "x-superproxy-allow-no-proxy") {
        session_opts.allow_no_proxy = v == "1";
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-strategy") {
        get_opts.strategy = match v.to_ascii_uppercase().as_str() {
            "FASTEST" => Strategy::Fastest,
            _ => Strategy::Random,
        };
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-max-retries").and_then(|v| v.parse::<u32>().ok()) {
        session_opts.max_retries = v;
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-wait") {
        get_opts.wait = Some(match v {
            "t" | "1" | "true" => Wait::Yes,
            "f" | "0" | "false" => Wait::No,
            other => other.parse::<u64>().map(Wait::Seconds).unwrap_or(Wait::Yes),
        });
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-persist") {
        get_opts.persist = match v {
            "t" | "1" | "true" => Persist::Sticky,
            "f" | "0" | "false" => Persist::None,
            addr => Persist::Addr(addr.to_string()),
        };
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-exclude") {
        get_opts.exclude = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-countries") {
        get_opts.countries = v.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-countries-exclude") {
        get_opts.countries_exclude = v.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-min-speed").and_then(|v| v.parse::<f64>().ok()) {
        get_opts.min_speed = Some(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-request-ident") {
        get_opts.request_ident = Some(v.to_string());
        session_opts.request_ident = Some(v.to_string());
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-success-response") {
        session_opts.success_response = decode_matcher(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-fail-response") {
        session_opts.fail_response = decode_matcher(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-rest-response") {
        session_opts.rest_response = decode_matcher(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-success-timeout").and_then(|v| v.parse::<u64>().ok()) {
        session_opts.success_timeout = Some(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-fail-timeout").and_then(|v| v.parse::<u64>().ok()) {
        session_opts.fail_timeout = Some(v);
    }
    if let Some(v) = header_str(headers, "x-superproxy-proxy-rest-timeout").and_then(|v| v.parse::<u64>().ok()) {
        session_opts.rest_timeout = Some(v);
    }
    let debug = header_str(headers, "x-superproxy-proxy-debug") == Some("1");
    session_opts.debug = debug;

    PolicyHeaders {
        get_opts,
        session_opts,
        debug,
    }
}

/// Strip hop-by-hop headers from an upstream response and recompute
/// `Content-Length` against the actually-buffered body (spec §4.7: "upstream
/// headers (hop-by-hop stripped, Content-Length recomputed)").
pub fn prepare_response_headers(headers: &HeaderMap, body_len: usize) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(
        HeaderName::from_static("content-length"),
        HeaderValue::from(body_len),
    );
    out
}

/// Response headers appended by the gateway on a successful brokered call
/// (spec §4.7/§6).
pub fn annotate_response(headers: &mut HeaderMap, addr: Option<&str>, fail_count: u32, rest_count: u32) {
    if let Some(addr) = addr {
        if let Ok(value) = HeaderValue::from_str(addr) {
            headers.insert(HeaderName::from_static("x-superproxy-addr"), value);
        }
    }
    headers.insert(
        HeaderName::from_static("x-superproxy-rest-count"),
        HeaderValue::from(rest_count),
    );
    headers.insert(
        HeaderName::from_static("x-superproxy-fail-count"),
        HeaderValue::from(fail_count),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_countries_and_max_retries() {
        let mut headers = HeaderMap::new();
        headers.insert("x-superproxy-proxy-countries", "us, de".parse().unwrap());
        headers.insert("x-superproxy-proxy-max-retries", "2".parse().unwrap());
        let decoded = decode(&headers, 3, 30);
        assert_eq!(decoded.get_opts.countries, vec!["US", "DE"]);
        assert_eq!(decoded.session_opts.max_retries, 2);
    }

    #[test]
    fn strips_hop_by_hop_and_control_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-superproxy-timeout", "5".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());
        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("connection").is_none());
        assert!(stripped.get("x-superproxy-timeout").is_none());
        assert!(stripped.get("accept").is_some());
    }

    #[test]
    fn prepare_response_headers_strips_hop_by_hop_and_recomputes_length() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "999".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        let prepared = prepare_response_headers(&headers, 4);
        assert_eq!(prepared.get("content-length").unwrap(), "4");
        assert!(prepared.get("connection").is_none());
        assert_eq!(prepared.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn decodes_url_encoded_matcher_json() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-superproxy-proxy-fail-response",
            "%7B%22status%22%3A%5B503%5D%7D".parse().unwrap(),
        );
        let decoded = decode(&headers, 3, 30);
        assert_eq!(decoded.session_opts.fail_response.unwrap().status, Some(vec![503]));
    }
}
