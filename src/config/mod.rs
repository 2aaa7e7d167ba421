//! Client configuration.
//!
//! Configuration can be built in code, loaded from environment variables, or loaded
//! from a YAML file with environment variable overrides. Priority:
//! YAML > ENV vars > .env values > defaults.
//!
//! # Example
//! ```rust,no_run
//! use stream_tts_client::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Credentials and overrides from the environment only
//! let config = ClientConfig::from_env()?;
//!
//! // YAML file, with environment variables filling what the file leaves out
//! let config = ClientConfig::from_file(&PathBuf::from("tts-client.yaml"))?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::errors::{TtsError, TtsResult};

mod env;
mod merge;
mod yaml;

pub use yaml::YamlConfig;

/// Control-plane API base URL (lease endpoint lives under it).
pub const DEFAULT_API_URL: &str = "https://api.play.ht/api";

/// gRPC inference address used when neither config nor lease names one.
pub const DEFAULT_GRPC_ADDR: &str = "prod.turbo.play.ht:443";

/// HTTP streaming endpoint used when neither config nor lease names one.
pub const DEFAULT_HTTP_URL: &str = "https://api.play.ht/api/v2/tts/stream";

/// Exponential backoff policy for retrying a whole synthesis exchange.
///
/// Defaults mirror the service's published gRPC retry policy: three attempts,
/// 10ms initial backoff growing 4x per attempt, capped at 300ms.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds).
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    pub max_backoff_ms: u64,

    /// Multiplier applied per additional attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 300,
            backoff_multiplier: 4.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based) before trying again.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64;
        let delay = base * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_backoff_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    #[inline]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Complete configuration for [`crate::Client`] and [`crate::BlockingClient`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Account user id, sent with every lease request.
    pub user_id: String,

    /// Account API key. Zeroized on drop and never printed.
    pub api_key: Zeroizing<String>,

    /// Control-plane base URL.
    pub api_url: String,

    /// Overrides the gRPC address carried by the lease.
    pub grpc_addr: Option<String>,

    /// Overrides the HTTP streaming URL.
    pub http_addr: Option<String>,

    /// Overrides the WebSocket URL carried by the lease.
    pub ws_addr: Option<String>,

    /// Use plaintext gRPC. Also implied for on-prem addresses.
    pub insecure: bool,

    /// After the gRPC retry budget against `grpc_addr` is spent, make one last attempt
    /// against the lease's inference address when it differs.
    pub fallback_enabled: bool,

    /// Strip `<...>` markup from input text before sending.
    pub remove_ssml_tags: bool,

    /// Keep the lease fresh from a background task.
    pub auto_refresh_lease: bool,

    /// Refresh once less than this fraction of the lease validity remains.
    pub lease_refresh_fraction: f64,

    /// Fetch attempts per lease refresh.
    pub lease_max_attempts: u32,

    /// Bound on a whole lease acquisition, including waiting on another refresh.
    pub lease_timeout: Duration,

    /// Bound on opening a new channel.
    pub connect_timeout: Duration,

    /// Bound on waiting for a free pooled channel.
    pub channel_acquire_timeout: Duration,

    /// Bound on each network read while streaming.
    pub read_timeout: Duration,

    /// Concurrent sessions per non-multiplexed endpoint.
    pub pool_max_per_endpoint: usize,

    /// Idle non-multiplexed channels kept per endpoint.
    pub pool_max_idle: usize,

    /// Idle channels older than this are evicted.
    pub pool_idle_timeout: Duration,

    /// Capacity of the bounded queues between network I/O and the consumer.
    pub chunk_buffer: usize,

    /// Retry policy for transient failures.
    pub retry: RetryConfig,

    /// Number of request records kept by the telemetry ring buffer.
    pub metrics_buffer_size: usize,

    /// Worker threads for [`crate::BlockingClient`]; `None` uses the tokio default.
    pub worker_threads: Option<usize>,
}

impl ClientConfig {
    /// Creates a configuration with the given credentials and defaults everywhere else.
    pub fn new(user_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            api_key: Zeroizing::new(api_key.into()),
            api_url: DEFAULT_API_URL.to_string(),
            grpc_addr: None,
            http_addr: None,
            ws_addr: None,
            insecure: false,
            fallback_enabled: false,
            remove_ssml_tags: false,
            auto_refresh_lease: false,
            lease_refresh_fraction: 0.1,
            lease_max_attempts: 2,
            lease_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            channel_acquire_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            pool_max_per_endpoint: 8,
            pool_max_idle: 4,
            pool_idle_timeout: Duration::from_secs(90),
            chunk_buffer: 8,
            retry: RetryConfig::default(),
            metrics_buffer_size: 1000,
            worker_threads: None,
        }
    }

    /// Loads configuration from environment variables (and a `.env` file if present).
    pub fn from_env() -> TtsResult<Self> {
        let _ = dotenvy::dotenv();
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file; environment variables fill unset values.
    pub fn from_file(path: &Path) -> TtsResult<Self> {
        let _ = dotenvy::dotenv();
        let yaml = YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> TtsResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(TtsError::Configuration("user_id is required".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(TtsError::Configuration("api_key is required".to_string()));
        }
        if !(self.lease_refresh_fraction > 0.0 && self.lease_refresh_fraction < 1.0) {
            return Err(TtsError::Configuration(format!(
                "lease_refresh_fraction must be between 0 and 1 (exclusive), got {}",
                self.lease_refresh_fraction
            )));
        }
        if self.lease_max_attempts == 0 || self.retry.max_attempts == 0 {
            return Err(TtsError::Configuration(
                "attempt budgets must be at least 1".to_string(),
            ));
        }
        if self.chunk_buffer == 0 || self.pool_max_per_endpoint == 0 {
            return Err(TtsError::Configuration(
                "chunk_buffer and pool_max_per_endpoint must be at least 1".to_string(),
            ));
        }
        if let Some(0) = self.worker_threads {
            return Err(TtsError::Configuration(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.api_url).map_err(|e| {
            TtsError::Configuration(format!("Invalid api_url '{}': {e}", self.api_url))
        })?;
        Ok(())
    }

    /// `Authorization` header value for control-plane calls.
    pub(crate) fn bearer_token(&self) -> String {
        if self.api_key.starts_with("Bearer ") {
            self.api_key.to_string()
        } else {
            format!("Bearer {}", self.api_key.as_str())
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user_id", &self.user_id)
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("grpc_addr", &self.grpc_addr)
            .field("http_addr", &self.http_addr)
            .field("ws_addr", &self.ws_addr)
            .field("insecure", &self.insecure)
            .field("fallback_enabled", &self.fallback_enabled)
            .field("remove_ssml_tags", &self.remove_ssml_tags)
            .field("auto_refresh_lease", &self.auto_refresh_lease)
            .field("retry", &self.retry)
            .field("pool_max_per_endpoint", &self.pool_max_per_endpoint)
            .field("chunk_buffer", &self.chunk_buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(retry.calculate_delay(2), Duration::from_millis(40));
        assert_eq!(retry.calculate_delay(3), Duration::from_millis(160));
        assert_eq!(retry.calculate_delay(4), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_budget() {
        let retry = RetryConfig::default();
        assert!(retry.should_retry(1));
        assert!(retry.should_retry(2));
        assert!(!retry.should_retry(3));
        assert!(!RetryConfig::disabled().should_retry(1));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = ClientConfig::new("user-1", "super-secret-key");
        let printed = format!("{config:?}");
        assert!(printed.contains("user-1"));
        assert!(!printed.contains("super-secret-key"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_bearer_token_not_doubled() {
        let config = ClientConfig::new("u", "abc");
        assert_eq!(config.bearer_token(), "Bearer abc");
        let config = ClientConfig::new("u", "Bearer abc");
        assert_eq!(config.bearer_token(), "Bearer abc");
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        assert!(ClientConfig::new("", "key").validate().is_err());
        assert!(ClientConfig::new("user", " ").validate().is_err());
        assert!(ClientConfig::new("user", "key").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = ClientConfig::new("user", "key");
        config.lease_refresh_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(TtsError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_buffers() {
        let mut config = ClientConfig::new("user", "key");
        config.chunk_buffer = 0;
        assert!(config.validate().is_err());
    }

    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    fn cleanup_env_vars() {
        unsafe {
            for key in [
                "PLAYHT_USER_ID",
                "PLAYHT_API_KEY",
                "PLAYHT_API_URL",
                "PLAYHT_GRPC_ADDR",
                "PLAYHT_HTTP_ADDR",
                "PLAYHT_WS_ADDR",
                "PLAYHT_INSECURE",
                "PLAYHT_MAX_ATTEMPTS",
                "PLAYHT_REMOVE_SSML_TAGS",
                "PLAYHT_AUTO_REFRESH_LEASE",
                "PLAYHT_FALLBACK_ENABLED",
            ] {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_reads_credentials_and_overrides() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PLAYHT_USER_ID", "env-user");
            env::set_var("PLAYHT_API_KEY", "env-key");
            env::set_var("PLAYHT_GRPC_ADDR", "localhost:50051");
            env::set_var("PLAYHT_INSECURE", "true");
            env::set_var("PLAYHT_MAX_ATTEMPTS", "5");
            env::set_var("PLAYHT_FALLBACK_ENABLED", "yes");
        }

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.user_id, "env-user");
        assert_eq!(config.api_key.as_str(), "env-key");
        assert_eq!(config.grpc_addr.as_deref(), Some("localhost:50051"));
        assert!(config.insecure);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.fallback_enabled);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_missing_credentials() {
        cleanup_env_vars();
        let result = ClientConfig::from_env();
        assert!(matches!(result, Err(TtsError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PLAYHT_USER_ID", "u");
            env::set_var("PLAYHT_API_KEY", "k");
            env::set_var("PLAYHT_MAX_ATTEMPTS", "many");
        }
        let err = ClientConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PLAYHT_MAX_ATTEMPTS"));
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("client.yaml");
        fs::write(
            &config_path,
            r#"
credentials:
  user_id: "yaml-user"
endpoints:
  ws_addr: "ws://127.0.0.1:9000/tts"
  fallback_enabled: true
pool:
  max_per_endpoint: 2
retry:
  max_attempts: 4
"#,
        )
        .unwrap();

        unsafe {
            env::set_var("PLAYHT_USER_ID", "env-user");
            env::set_var("PLAYHT_API_KEY", "env-key");
            env::set_var("PLAYHT_MAX_ATTEMPTS", "2");
        }

        let config = ClientConfig::from_file(&config_path).unwrap();
        assert_eq!(config.user_id, "yaml-user");
        assert_eq!(config.api_key.as_str(), "env-key");
        assert_eq!(config.ws_addr.as_deref(), Some("ws://127.0.0.1:9000/tts"));
        assert_eq!(config.pool_max_per_endpoint, 2);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.fallback_enabled);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();
        let result = ClientConfig::from_file(Path::new("/nonexistent/client.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }
}
