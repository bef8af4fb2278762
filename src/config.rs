use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SuperproxyError};

/// Application configuration. Loaded from environment variables, optionally
/// overlaid with a JSON config file (`-c`) and a JSON override string
/// (`-o`), matching the override precedence of the original CLI's
/// `load_config` (file < override string < explicit env for secrets).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub checker: CheckerConfig,
    pub fetcher: FetcherConfig,
    pub gateway: GatewayConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Max concurrent `in_use` per proxy.
    pub max_simultaneous: u32,
    /// Consecutive failures before blacklisting.
    pub max_fail: u32,
    /// Minimum active-pool size before `need_update` fires.
    pub min_size: usize,
    /// Debounce interval (seconds) between `maybe_update` maintenance runs.
    pub update_timeout: u64,
    /// Recheck a proxy if `used_at` is older than this (seconds).
    pub recheck_timeout: u64,
    /// Drop a shared connection-pool entry if idle this long (seconds).
    pub pool_manager_timeout: u64,
    /// Drop blacklist entries older than this (seconds).
    pub blacklist_timeout: u64,
    /// Bounded ring length of per-proxy history.
    pub history_size: usize,
    /// Default fail-timeout applied to `rest_till` on failure (seconds).
    pub fail_timeout: u64,
    /// Default success-timeout applied to `rest_till` on success (seconds).
    pub success_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_simultaneous: 1,
            max_fail: 3,
            min_size: 10,
            update_timeout: 60,
            recheck_timeout: 1800,
            pool_manager_timeout: 300,
            blacklist_timeout: 86_400,
            history_size: 20,
            fail_timeout: 0,
            success_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub pool_size: usize,
    pub timeout: u64,
    pub retry_count: u32,
    pub retry_wait: u64,
    pub http_check: bool,
    pub https_check: bool,
    pub https_force_check: bool,
    /// Reference echo endpoints; the first reachable one is used per probe.
    pub targets: Vec<String>,
    /// Bounded ring length of per-proxy history recorded for each probe.
    pub history_size: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            timeout: 10,
            retry_count: 0,
            retry_wait: 1,
            http_check: true,
            https_check: true,
            https_force_check: false,
            targets: vec![
                "http://httpbin.org/get".to_string(),
                "https://httpbin.org/get".to_string(),
            ],
            history_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Scraper names to run; `["*"]` = every registered scraper.
    pub scrapers: Vec<String>,
    pub pool_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            scrapers: vec!["*".to_string()],
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Glob patterns of allowed client IPs for the proxy path; empty = any.
    pub proxy_ip_allow: Vec<String>,
    /// Glob patterns of allowed client IPs for the admin path; empty = any.
    pub admin_ip_allow: Vec<String>,
    /// Basic-auth credentials for the proxy path (`user` -> `pass`).
    #[serde(skip_serializing)]
    pub proxy_auth: HashMap<String, String>,
    /// Basic-auth credentials for the admin path.
    #[serde(skip_serializing)]
    pub admin_auth: HashMap<String, String>,
    /// Default outbound request timeout (seconds).
    pub request_timeout: u64,
    pub default_max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            proxy_ip_allow: Vec::new(),
            admin_ip_allow: Vec::new(),
            proxy_auth: HashMap::new(),
            admin_auth: HashMap::new(),
            request_timeout: 30,
            default_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            checker: CheckerConfig::default(),
            fetcher: FetcherConfig::default(),
            gateway: GatewayConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Build the effective configuration: defaults, overlaid with an
    /// optional JSON config file, overlaid with an optional JSON override
    /// string, overlaid with a handful of ambient env vars for secrets.
    pub fn load(config_path: Option<&Path>, options: Option<&str>) -> Result<Self> {
        let mut value = serde_json::to_value(Config::default())
            .map_err(|e| SuperproxyError::InvalidConfig(e.to_string()))?;

        if let Some(path) = config_path {
            let raw = std::fs::read_to_string(path)?;
            let file_value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json(&mut value, file_value);
        }

        if let Some(options) = options {
            if !options.trim().is_empty() {
                let override_value: serde_json::Value = serde_json::from_str(options)?;
                merge_json(&mut value, override_value);
            }
        }

        let mut config: Config = serde_json::from_value(value)?;

        if let Ok(port) = env::var("SUPERPROXY_PORT") {
            config.gateway.port = port
                .parse()
                .map_err(|_| SuperproxyError::InvalidConfig("SUPERPROXY_PORT must be a port".into()))?;
        }
        if let Ok(level) = env::var("SUPERPROXY_LOG_LEVEL") {
            config.log.level = level;
        }

        Ok(config)
    }

    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

/// Shallow recursive merge of `patch` into `base`, object fields only
/// (array and scalar fields are replaced wholesale).
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loadable_without_a_config_file() {
        let config = Config::load(None, None).unwrap();
        assert_eq!(config.pool.max_simultaneous, 1);
        assert_eq!(config.gateway.port, 8080);
    }

    #[test]
    fn options_string_overrides_defaults() {
        let config = Config::load(None, Some(r#"{"pool":{"max_simultaneous":5}}"#)).unwrap();
        assert_eq!(config.pool.max_simultaneous, 5);
        // untouched fields keep their defaults
        assert_eq!(config.pool.max_fail, 3);
    }
}
