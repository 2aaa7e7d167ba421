use std::time::Duration;

use zeroize::Zeroizing;

use super::env::EnvConfig;
use super::yaml::YamlConfig;
use super::ClientConfig;
use crate::errors::{TtsError, TtsResult};

/// Builds a [`ClientConfig`] from environment variables with optional YAML overrides.
///
/// Priority: YAML > environment > defaults.
pub(super) fn merge_config(yaml: Option<YamlConfig>) -> TtsResult<ClientConfig> {
    let env = EnvConfig::load()?;
    let yaml = yaml.unwrap_or_default();

    let credentials = yaml.credentials.unwrap_or_default();
    let user_id = credentials
        .user_id
        .or(env.user_id)
        .ok_or_else(|| TtsError::Configuration("PLAYHT_USER_ID is not set".to_string()))?;
    let api_key = credentials
        .api_key
        .or(env.api_key)
        .ok_or_else(|| TtsError::Configuration("PLAYHT_API_KEY is not set".to_string()))?;

    let mut config = ClientConfig::new(user_id, String::new());
    config.api_key = Zeroizing::new(api_key);

    let endpoints = yaml.endpoints.unwrap_or_default();
    if let Some(api_url) = endpoints.api_url.or(env.api_url) {
        config.api_url = api_url;
    }
    config.grpc_addr = endpoints.grpc_addr.or(env.grpc_addr);
    config.http_addr = endpoints.http_addr.or(env.http_addr);
    config.ws_addr = endpoints.ws_addr.or(env.ws_addr);
    config.insecure = endpoints.insecure.or(env.insecure).unwrap_or(config.insecure);
    config.fallback_enabled = endpoints
        .fallback_enabled
        .or(env.fallback_enabled)
        .unwrap_or(config.fallback_enabled);

    let lease = yaml.lease.unwrap_or_default();
    config.auto_refresh_lease = lease
        .auto_refresh
        .or(env.auto_refresh_lease)
        .unwrap_or(config.auto_refresh_lease);
    if let Some(fraction) = lease.refresh_fraction {
        config.lease_refresh_fraction = fraction;
    }
    if let Some(attempts) = lease.max_attempts {
        config.lease_max_attempts = attempts;
    }
    if let Some(ms) = lease.timeout_ms {
        config.lease_timeout = Duration::from_millis(ms);
    }

    let transport = yaml.transport.unwrap_or_default();
    if let Some(ms) = transport.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = transport.channel_acquire_timeout_ms {
        config.channel_acquire_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = transport.read_timeout_ms {
        config.read_timeout = Duration::from_millis(ms);
    }
    if let Some(size) = transport.chunk_buffer {
        config.chunk_buffer = size;
    }
    config.worker_threads = transport.worker_threads;

    let pool = yaml.pool.unwrap_or_default();
    if let Some(max) = pool.max_per_endpoint {
        config.pool_max_per_endpoint = max;
    }
    if let Some(max) = pool.max_idle {
        config.pool_max_idle = max;
    }
    if let Some(ms) = pool.idle_timeout_ms {
        config.pool_idle_timeout = Duration::from_millis(ms);
    }

    let retry = yaml.retry.unwrap_or_default();
    if let Some(attempts) = retry.max_attempts.or(env.max_attempts) {
        config.retry.max_attempts = attempts;
    }
    if let Some(ms) = retry.initial_backoff_ms {
        config.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = retry.max_backoff_ms {
        config.retry.max_backoff_ms = ms;
    }
    if let Some(multiplier) = retry.backoff_multiplier {
        config.retry.backoff_multiplier = multiplier;
    }

    config.remove_ssml_tags = yaml
        .text
        .and_then(|t| t.remove_ssml_tags)
        .or(env.remove_ssml_tags)
        .unwrap_or(config.remove_ssml_tags);

    if let Some(size) = yaml.metrics.and_then(|m| m.buffer_size) {
        config.metrics_buffer_size = size;
    }

    Ok(config)
}
