//! Access control (spec §4.7): an optional IP allow-list (glob) and HTTP
//! Basic credential map, evaluated independently for the proxy path and
//! the admin path. Adapted from the teacher's `ProxyAuth`, generalised
//! from a single fixed credential to a username->password map and from
//! 407/`Proxy-Authorization` (hop-by-hop, tunnel-style) to 401/
//! `Authorization` (spec §4.7 names `WWW-Authenticate`, not
//! `Proxy-Authenticate` — this gateway terminates HTTP, it doesn't tunnel).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::header::HeaderMap;

use crate::error::{Result, SuperproxyError};

#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    ip_allow: Vec<String>,
    credentials: HashMap<String, String>,
}

impl AccessControl {
    pub fn new(ip_allow: Vec<String>, credentials: HashMap<String, String>) -> Self {
        Self {
            ip_allow,
            credentials,
        }
    }

    pub fn check_ip(&self, client_ip: &str) -> Result<()> {
        if self.ip_allow.is_empty() {
            return Ok(());
        }
        if self.ip_allow.iter().any(|pattern| glob_match(pattern, client_ip)) {
            Ok(())
        } else {
            Err(SuperproxyError::AuthenticationFailed)
        }
    }

    pub fn check_basic_auth(&self, headers: &HeaderMap) -> Result<()> {
        if self.credentials.is_empty() {
            return Ok(());
        }
        let header = headers
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(SuperproxyError::AuthenticationFailed)?;
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or(SuperproxyError::AuthenticationFailed)?;
        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| SuperproxyError::AuthenticationFailed)?;
        let text = String::from_utf8(decoded).map_err(|_| SuperproxyError::AuthenticationFailed)?;
        let (user, pass) = text.split_once(':').ok_or(SuperproxyError::AuthenticationFailed)?;
        match self.credentials.get(user) {
            Some(expected) if expected == pass => Ok(()),
            _ => Err(SuperproxyError::AuthenticationFailed),
        }
    }
}

/// A tiny `*`-only glob matcher for IP allow-list patterns (e.g.
/// `192.168.*.*`). Deliberately not a full glob implementation — the
/// spec only needs wildcard octet/segment matching.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut pat = regex::escape(pattern);
    pat = pat.replace(r"\*", ".*");
    match regex::Regex::new(&format!("^{pat}$")) {
        Ok(re) => re.is_match(value),
        Err(_) => pattern == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_wildcard_segments() {
        assert!(glob_match("192.168.*.*", "192.168.1.42"));
        assert!(!glob_match("192.168.*.*", "10.0.0.1"));
        assert!(glob_match("10.0.0.1", "10.0.0.1"));
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        let ac = AccessControl::default();
        assert!(ac.check_ip("1.2.3.4").is_ok());
    }

    #[test]
    fn basic_auth_accepts_known_credentials_and_rejects_others() {
        let mut creds = HashMap::new();
        creds.insert("alice".to_string(), "secret".to_string());
        let ac = AccessControl::new(Vec::new(), creds);

        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode(b"alice:secret");
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert!(ac.check_basic_auth(&headers).is_ok());

        let mut wrong_headers = HeaderMap::new();
        let wrong = BASE64.encode(b"alice:wrong");
        wrong_headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Basic {wrong}").parse().unwrap(),
        );
        assert!(ac.check_basic_auth(&wrong_headers).is_err());
    }
}
