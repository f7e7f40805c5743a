//! Configuration management for the proxy.
//!
//! Loads settings from `~/.config/openrouter-proxy/config.toml` with environment overrides.

use crate::keys::{mask_key, SelectionStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Prefix under which the proxy exposes the upstream API.
pub const API_PREFIX: &str = "/api/v1";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token local clients must present.
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Level for per-request access logs.
    #[serde(default = "default_log_level")]
    pub http_log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Applies to buffered calls only; streaming calls never time out.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Restrict model listings to zero-priced entries.
    #[serde(default)]
    pub free_only: bool,
    /// Pause before retrying after a vendor quota error. 0 disables.
    #[serde(default)]
    pub vendor_quota_delay_secs: u64,
    #[serde(default)]
    pub proxy: OutboundProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OutboundProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeysConfig {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub sticky: bool,
}

/// Path-prefix lists used to classify inbound requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointsConfig {
    #[serde(default = "default_public_endpoints")]
    pub public: Vec<String>,
    #[serde(default = "default_binary_endpoints")]
    pub binary: Vec<String>,
    #[serde(default = "default_completion_endpoints")]
    pub completion: Vec<String>,
    #[serde(default = "default_models_endpoints")]
    pub models: Vec<String>,
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 5555 }
fn default_log_level() -> String { "info".to_string() }
fn default_base_url() -> String { DEFAULT_UPSTREAM_BASE_URL.to_string() }
fn default_connect_timeout() -> u64 { crate::http::DEFAULT_CONNECT_TIMEOUT.as_secs() }
fn default_read_timeout() -> u64 { 120 }
fn default_cooldown() -> u64 { 14_400 }
fn default_public_endpoints() -> Vec<String> { vec!["/api/v1/models".to_string()] }
fn default_binary_endpoints() -> Vec<String> { vec!["/api/v1/generation".to_string()] }
fn default_completion_endpoints() -> Vec<String> {
    vec![
        "/api/v1/completions".to_string(),
        "/api/v1/chat/completions".to_string(),
    ]
}
fn default_models_endpoints() -> Vec<String> { vec!["/api/v1/models".to_string()] }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_key: String::new(),
            log_level: default_log_level(),
            http_log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            free_only: false,
            vendor_quota_delay_secs: 0,
            proxy: OutboundProxyConfig::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Outbound proxy URL, if one is enabled.
    pub fn proxy_url(&self) -> Option<&str> {
        (self.proxy.enabled && !self.proxy.url.is_empty()).then_some(self.proxy.url.as_str())
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            cooldown_secs: default_cooldown(),
            strategy: SelectionStrategy::default(),
            sticky: false,
        }
    }
}

impl KeysConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            public: default_public_endpoints(),
            binary: default_binary_endpoints(),
            completion: default_completion_endpoints(),
            models: default_models_endpoints(),
        }
    }
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openrouter-proxy")
            .join("config.toml")
    }

    /// Load config from file, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from a specific path.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("PROXY_ACCESS_KEY") {
            self.server.access_key = key;
        }
        if let Ok(keys) = std::env::var("UPSTREAM_API_KEYS") {
            self.keys.keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(val) = std::env::var("PROXY_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(url) = std::env::var("UPSTREAM_PROXY_URL") {
            self.upstream.proxy = OutboundProxyConfig { enabled: true, url };
        }
        self
    }

    /// Reject configurations the proxy cannot serve with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.keys.is_empty() {
            return Err(ConfigError::Invalid("no upstream API keys configured".to_string()));
        }
        if self.server.access_key.is_empty() {
            return Err(ConfigError::Invalid("server.access_key must be set".to_string()));
        }
        if self.upstream.proxy.enabled && self.upstream.proxy.url.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.proxy is enabled but has no url".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy with every secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.server.access_key.is_empty() {
            config.server.access_key = mask_key(&config.server.access_key);
        }
        config.keys.keys = config.keys.keys.iter().map(|k| mask_key(k)).collect();
        config
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_config_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(&config_path, r#"
[server]
port = 9090
access_key = "local-secret"

[keys]
keys = ["sk-or-one", "sk-or-two"]
cooldown_secs = 60
strategy = "first"
sticky = true

[upstream]
free_only = true
"#).unwrap();

        let config = Config::load_from(config_path).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.access_key, "local-secret");
        assert_eq!(config.keys.keys, vec!["sk-or-one", "sk-or-two"]);
        assert_eq!(config.keys.cooldown(), Duration::from_secs(60));
        assert_eq!(config.keys.strategy, SelectionStrategy::First);
        assert!(config.keys.sticky);
        assert!(config.upstream.free_only);
        assert_eq!(config.upstream.base_url, DEFAULT_UPSTREAM_BASE_URL);
    }

    #[test]
    fn returns_defaults_when_file_missing() {
        let config = Config::load_from(PathBuf::from("/nonexistent/path/config.toml")).unwrap();

        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert_eq!(config.keys.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.endpoints.public, vec!["/api/v1/models"]);
        assert_eq!(
            config.endpoints.completion,
            vec!["/api/v1/completions", "/api/v1/chat/completions"]
        );
    }

    #[test]
    fn reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "[keys]\nstrategy = \"fastest\"\n").unwrap();

        let result = Config::load_from(config_path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overrides_keys_from_environment() {
        std::env::set_var("UPSTREAM_API_KEYS", "key-one, ,key-two");
        std::env::set_var("PROXY_ACCESS_KEY", "env-access");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.keys.keys, vec!["key-one", "key-two"]);
        assert_eq!(config.server.access_key, "env-access");

        std::env::remove_var("UPSTREAM_API_KEYS");
        std::env::remove_var("PROXY_ACCESS_KEY");
    }

    #[test]
    fn validation_requires_keys_and_access_key() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.keys.keys = vec!["k".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.server.access_key = "local".to_string();
        assert!(config.validate().is_ok());

        config.upstream.proxy.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn proxy_url_only_when_enabled() {
        let mut upstream = UpstreamConfig::default();
        upstream.proxy.url = "http://127.0.0.1:3128".to_string();
        assert_eq!(upstream.proxy_url(), None);

        upstream.proxy.enabled = true;
        assert_eq!(upstream.proxy_url(), Some("http://127.0.0.1:3128"));
    }

    #[test]
    fn redacted_masks_secrets() {
        let mut config = Config::default();
        config.server.access_key = "super-secret-access".to_string();
        config.keys.keys = vec!["sk-or-v1-0123456789".to_string()];

        let shown = config.redacted();

        assert_eq!(shown.server.access_key, "supe****cess");
        assert_eq!(shown.keys.keys, vec!["sk-o****6789"]);
    }
}
