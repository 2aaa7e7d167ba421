use std::path::Path;

use serde::Deserialize;

use crate::errors::{TtsError, TtsResult};

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Environment variables fill
/// in anything the file leaves out.
///
/// # Example YAML structure
/// ```yaml
/// credentials:
///   user_id: "your-user-id"
///   api_key: "your-api-key"
///
/// endpoints:
///   api_url: "https://api.play.ht/api"
///   grpc_addr: "prod.turbo.play.ht:443"
///   http_addr: "https://api.play.ht/api/v2/tts/stream"
///   ws_addr: "wss://example.invalid/tts"
///   insecure: false
///   fallback_enabled: false
///
/// lease:
///   auto_refresh: true
///   refresh_fraction: 0.1
///   max_attempts: 2
///   timeout_ms: 60000
///
/// transport:
///   connect_timeout_ms: 10000
///   channel_acquire_timeout_ms: 5000
///   read_timeout_ms: 30000
///   chunk_buffer: 8
///   worker_threads: 4
///
/// pool:
///   max_per_endpoint: 8
///   max_idle: 4
///   idle_timeout_ms: 90000
///
/// retry:
///   max_attempts: 3
///   initial_backoff_ms: 10
///   max_backoff_ms: 300
///   backoff_multiplier: 4.0
///
/// text:
///   remove_ssml_tags: true
///
/// metrics:
///   buffer_size: 1000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub credentials: Option<CredentialsYaml>,
    pub endpoints: Option<EndpointsYaml>,
    pub lease: Option<LeaseYaml>,
    pub transport: Option<TransportYaml>,
    pub pool: Option<PoolYaml>,
    pub retry: Option<RetryYaml>,
    pub text: Option<TextYaml>,
    pub metrics: Option<MetricsYaml>,
}

/// Account credentials from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CredentialsYaml {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

/// Endpoint overrides from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EndpointsYaml {
    pub api_url: Option<String>,
    pub grpc_addr: Option<String>,
    pub http_addr: Option<String>,
    pub ws_addr: Option<String>,
    pub insecure: Option<bool>,
    pub fallback_enabled: Option<bool>,
}

/// Lease settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LeaseYaml {
    pub auto_refresh: Option<bool>,
    pub refresh_fraction: Option<f64>,
    pub max_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
}

/// Transport settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TransportYaml {
    pub connect_timeout_ms: Option<u64>,
    pub channel_acquire_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub chunk_buffer: Option<usize>,
    pub worker_threads: Option<usize>,
}

/// Connection pool settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PoolYaml {
    pub max_per_endpoint: Option<usize>,
    pub max_idle: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
}

/// Retry policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetryYaml {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

/// Text preparation from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TextYaml {
    pub remove_ssml_tags: Option<bool>,
}

/// Telemetry settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetricsYaml {
    pub buffer_size: Option<usize>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &Path) -> TtsResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TtsError::Configuration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_str(&contents)
    }

    /// Parse YAML configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> TtsResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}
