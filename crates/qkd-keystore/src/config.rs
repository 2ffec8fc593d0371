//! Site and scenario configuration

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeyStoreError, Result};

pub const DEFAULT_SITE_ADDRESS: &str = "127.0.0.1:7000";
pub const DEFAULT_CACHE_THRESHOLD: u64 = 100_000;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Tuning shared by every key store a factory creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreOptions {
    /// Unused keys kept in memory before overflowing to the backing store
    pub cache_threshold: u64,
    /// Upper bound for every blocking wait
    pub wait_timeout_ms: u64,
}

impl Default for KeyStoreOptions {
    fn default() -> Self {
        Self {
            cache_threshold: DEFAULT_CACHE_THRESHOLD,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

impl KeyStoreOptions {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cache_threshold(mut self, threshold: u64) -> Self {
        self.cache_threshold = threshold;
        self
    }
}

/// Configuration of one site agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// `host:port` this site is known by
    pub site_address: String,
    /// Backing store url, empty for none
    pub backing_store: String,
    pub keystore: KeyStoreOptions,
    /// Addresses that belong to this host in addition to its interfaces
    pub local_addresses: Vec<IpAddr>,
    /// Sites with a direct key link, stores are created at start up
    pub neighbours: Vec<String>,
    /// Destination -> hops for sites reached by relay
    pub paths: BTreeMap<String, Vec<String>>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_address: DEFAULT_SITE_ADDRESS.to_string(),
            backing_store: String::new(),
            keystore: KeyStoreOptions::default(),
            local_addresses: Vec::new(),
            neighbours: Vec::new(),
            paths: BTreeMap::new(),
        }
    }
}

impl SiteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_address.is_empty() {
            return Err(KeyStoreError::InvalidArgument("site_address is empty".into()));
        }

        for (destination, hops) in &self.paths {
            if hops.is_empty() {
                return Err(KeyStoreError::InvalidArgument(format!(
                    "Path to {} has no hops",
                    destination
                )));
            }
            if hops.iter().any(|hop| hop == destination || hop == &self.site_address) {
                return Err(KeyStoreError::InvalidArgument(format!(
                    "Path to {} loops back on itself",
                    destination
                )));
            }
        }
        Ok(())
    }
}

/// A simulated key link between two sites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: String,
    pub b: String,
    #[serde(default = "default_key_length")]
    pub key_length: usize,
    #[serde(default = "default_key_count")]
    pub key_count: usize,
}

fn default_key_length() -> usize {
    32
}

fn default_key_count() -> usize {
    16
}

/// A key request made once the links are running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub from: String,
    pub to: String,
    #[serde(default = "default_request_count")]
    pub count: usize,
}

fn default_request_count() -> usize {
    1
}

/// Several sites wired together in one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    #[serde(rename = "site")]
    pub sites: Vec<SiteConfig>,
    #[serde(rename = "link")]
    pub links: Vec<LinkConfig>,
    #[serde(rename = "request")]
    pub requests: Vec<RequestConfig>,
}

impl ScenarioConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        for site in &scenario.sites {
            site.validate()?;
        }

        let known = |address: &str| scenario.sites.iter().any(|s| s.site_address == address);
        for link in &scenario.links {
            if !known(&link.a) || !known(&link.b) {
                return Err(KeyStoreError::InvalidArgument(format!(
                    "Link {} <-> {} names an unknown site",
                    link.a, link.b
                )));
            }
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SiteConfig::from_toml_str("").unwrap();
        assert_eq!(config.site_address, DEFAULT_SITE_ADDRESS);
        assert_eq!(config.keystore.cache_threshold, 100_000);
        assert_eq!(config.keystore.wait_timeout(), Duration::from_secs(30));
        assert!(config.backing_store.is_empty());
    }

    #[test]
    fn test_site_config() {
        let config = SiteConfig::from_toml_str(
            r#"
            site_address = "10.0.0.1:7000"
            backing_store = "memory:"
            local_addresses = ["192.168.1.10"]
            neighbours = ["10.0.0.2:7000"]

            [keystore]
            cache_threshold = 50
            wait_timeout_ms = 250

            [paths]
            "10.0.0.3:7000" = ["10.0.0.2:7000"]
            "#,
        )
        .unwrap();

        assert_eq!(config.keystore.cache_threshold, 50);
        assert_eq!(config.keystore.wait_timeout(), Duration::from_millis(250));
        assert_eq!(config.local_addresses, vec!["192.168.1.10".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.paths["10.0.0.3:7000"], vec!["10.0.0.2:7000".to_string()]);
    }

    #[test]
    fn test_path_loop_is_rejected() {
        let result = SiteConfig::from_toml_str(
            r#"
            site_address = "a:1"
            [paths]
            "c:1" = ["b:1", "a:1"]
            "#,
        );
        assert!(matches!(result, Err(KeyStoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_bad_toml() {
        let result = SiteConfig::from_toml_str("keystore = 5");
        assert!(matches!(result, Err(KeyStoreError::ConfigError(_))));
    }

    #[test]
    fn test_scenario() {
        let scenario = ScenarioConfig::from_toml_str(
            r#"
            [[site]]
            site_address = "a:1"
            [[site]]
            site_address = "b:1"

            [[link]]
            a = "a:1"
            b = "b:1"
            key_count = 4

            [[request]]
            from = "a:1"
            to = "b:1"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.sites.len(), 2);
        assert_eq!(scenario.links[0].key_length, 32);
        assert_eq!(scenario.links[0].key_count, 4);
        assert_eq!(scenario.requests[0].count, 1);

        let result = ScenarioConfig::from_toml_str(
            r#"
            [[link]]
            a = "a:1"
            b = "z:1"
            "#,
        );
        assert!(matches!(result, Err(KeyStoreError::InvalidArgument(_))));
    }
}
