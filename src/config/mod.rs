pub mod validation;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use self::validation::validate_config;
use crate::eventstream::frame::DEFAULT_MAX_FRAME_LEN;
use crate::eventstream::router::DEFAULT_FALLBACK_THRESHOLD;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    base_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
            // explicit null => tokio default
            runtime_worker_threads: match wire.runtime_worker_threads {
                Some(RuntimeThreadsSetting::Fixed(threads)) => Some(threads),
                Some(RuntimeThreadsSetting::Auto(())) | None => None,
            },
            base_path: normalize_base_path(&wire.base_path),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            base_path: String::new(),
        }
    }
}

/// `"/api/"` → `"/api"`, `"/"` → `""`.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Code-assistant backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub access_token: String,
    #[serde(default)]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Client model name → backend model id. Unmapped names pass through.
    #[serde(default)]
    pub model_map: FxHashMap<String, String>,
}

impl BackendConfig {
    #[must_use]
    pub fn resolve_model<'a>(&'a self, client_model: &'a str) -> &'a str {
        self.model_map
            .get(client_model)
            .map_or(client_model, String::as_str)
    }

    /// Full URL of the streaming generation endpoint.
    #[must_use]
    pub fn generate_url(&self) -> String {
        format!(
            "{}/generateAssistantResponse",
            self.base_url.trim_end_matches('/')
        )
    }
}

/// Client authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    pub allowed_keys: Vec<String>,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Event-stream decoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Consecutive malformed frames before switching to text recovery.
    #[serde(default = "default_fallback_failure_threshold")]
    pub fallback_failure_threshold: u32,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_fallback_failure_threshold() -> u32 {
    DEFAULT_FALLBACK_THRESHOLD
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fallback_failure_threshold: default_fallback_failure_threshold(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Parse and validate a YAML document.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.http_pool_max_idle_per_host, 16);
        assert_eq!(config.client_authentication.allowed_keys.len(), 2);
        assert_eq!(config.stream.fallback_failure_threshold, 3);
        assert_eq!(
            config.backend.resolve_model("claude-sonnet-4"),
            "CLAUDE_SONNET_4_20250514_V1_0"
        );
    }

    #[test]
    fn test_stream_defaults() {
        let stream = StreamConfig::default();
        assert_eq!(stream.fallback_failure_threshold, 3);
        assert_eq!(stream.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_base_path_is_normalized() {
        assert_eq!(normalize_base_path("api/"), "/api");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path(""), "");
    }

    #[test]
    fn test_unmapped_model_passes_through() {
        let backend = BackendConfig {
            base_url: "https://example.test".into(),
            access_token: "t".into(),
            profile_arn: None,
            proxy: None,
            model_map: FxHashMap::default(),
        };
        assert_eq!(backend.resolve_model("anything"), "anything");
        assert_eq!(
            backend.generate_url(),
            "https://example.test/generateAssistantResponse"
        );
    }
}
