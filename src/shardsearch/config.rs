use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::request::{PartitionLayout, PartitionMode};

/// Environment variable holding the administrative engine key.
pub const ADMIN_API_KEY_ENV: &str = "SHARDSEARCH_ADMIN_API_KEY";
/// Environment variable holding the parent key of scoped search keys.
pub const SEARCH_API_KEY_ENV: &str = "SHARDSEARCH_SEARCH_API_KEY";

/// Caller token known to the token authorizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Token value as sent by the caller.
    pub token: String,
    /// Holder may use the search proxy.
    #[serde(default)]
    pub can_use: bool,
}

/// Proxy configuration, built once at start-up and shared by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base URL of the search engine, e.g. `http://127.0.0.1:8108`.
    pub upstream_url: String,
    /// Administrative engine key, used for every non-search call.
    pub admin_api_key: String,
    /// Parent key for scoped search keys. Falls back to the admin key when empty.
    pub search_api_key: String,
    /// Lifetime of generated scoped search keys.
    pub scoped_key_ttl_secs: u64,
    /// Number of partitions searches are split over.
    pub num_partitions: u64,
    /// Numeric document field the partitions are ranges of.
    pub partition_key: String,
    /// Size of the partition key domain `[0, partition_domain)`.
    pub partition_domain: u64,
    /// How partitions are addressed.
    pub partition_mode: PartitionMode,
    /// Timeout of one engine call.
    pub timeout_ms: u64,
    /// Retries of an engine call after a transport error.
    pub retries: usize,
    /// Initial retry delay, doubled per attempt.
    pub retry_backoff_ms: u64,
    /// Address the server binds to.
    pub local_ip: String,
    /// Port the server listens on.
    pub local_port: u16,
    /// Caller tokens known to the token authorizer.
    pub tokens: Vec<TokenEntry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            upstream_url: "http://127.0.0.1:8108".to_string(),
            admin_api_key: String::new(),
            search_api_key: String::new(),
            scoped_key_ttl_secs: 3600,
            num_partitions: 1,
            partition_key: "partition".to_string(),
            partition_domain: 100,
            partition_mode: PartitionMode::Filter,
            timeout_ms: 5000,
            retries: 3,
            retry_backoff_ms: 150,
            local_ip: "0.0.0.0".to_string(),
            local_port: 8109,
            tokens: Vec::new(),
        }
    }
}

fn parse_param<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProxyError::Config(format!("invalid value '{value}' for {name}")))
}

impl ProxyConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<ProxyConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ProxyError::Config(format!("{}: {e}", path.display())))
    }

    /// Build the configuration from command line `key=value` parameters and the environment.
    ///
    /// Precedence, lowest first: defaults, the file named by `config`, environment, parameters.
    pub fn load(params: &HashMap<String, String>, env: &HashMap<String, String>) -> Result<ProxyConfig> {
        let mut config = match params.get("config") {
            Some(path) => ProxyConfig::from_file(Path::new(path))?,
            None => ProxyConfig::default(),
        };

        if let Some(key) = env.get(ADMIN_API_KEY_ENV) {
            config.admin_api_key = key.clone();
        }
        if let Some(key) = env.get(SEARCH_API_KEY_ENV) {
            config.search_api_key = key.clone();
        }

        for (name, value) in params.iter() {
            match name.as_str() {
                "upstream_url" => config.upstream_url = value.clone(),
                "admin_api_key" => config.admin_api_key = value.clone(),
                "search_api_key" => config.search_api_key = value.clone(),
                "scoped_key_ttl_secs" => config.scoped_key_ttl_secs = parse_param(name, value)?,
                "num_partitions" => config.num_partitions = parse_param(name, value)?,
                "partition_key" => config.partition_key = value.clone(),
                "partition_domain" => config.partition_domain = parse_param(name, value)?,
                "partition_mode" => {
                    config.partition_mode = match value.to_lowercase().as_str() {
                        "filter" => PartitionMode::Filter,
                        "alias" => PartitionMode::Alias,
                        _ => {
                            return Err(ProxyError::Config(format!(
                                "partition_mode must be filter or alias, got '{value}'"
                            )));
                        }
                    }
                }
                "timeout_ms" => config.timeout_ms = parse_param(name, value)?,
                "retries" => config.retries = parse_param(name, value)?,
                "retry_backoff_ms" => config.retry_backoff_ms = parse_param(name, value)?,
                "local_ip" => config.local_ip = value.clone(),
                "local_port" => config.local_port = parse_param(name, value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot serve a single request.
    pub fn validate(&self) -> Result<()> {
        if self.admin_api_key.trim().is_empty() {
            return Err(ProxyError::Config("admin_api_key is not set".to_string()));
        }
        if url::Url::parse(&self.upstream_url).is_err() {
            return Err(ProxyError::Config(format!(
                "upstream_url '{}' is not a valid URL",
                self.upstream_url
            )));
        }
        self.layout().validate()
    }

    /// Partition layout searches are split over.
    pub fn layout(&self) -> PartitionLayout {
        PartitionLayout {
            partition_key: self.partition_key.clone(),
            total_domain: self.partition_domain,
            num_partitions: self.num_partitions,
            mode: self.partition_mode.clone(),
        }
    }

    /// Parent key of scoped search keys.
    pub fn search_parent_key(&self) -> &str {
        if self.search_api_key.is_empty() {
            &self.admin_api_key
        } else {
            &self.search_api_key
        }
    }

    /// Timeout of one engine call.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
