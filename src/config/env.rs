use std::env;
use std::str::FromStr;

use crate::errors::{TtsError, TtsResult};

/// Values read from environment variables.
///
/// Every field is optional; [`super::merge`] layers YAML values over these and falls
/// back to defaults for anything still unset.
#[derive(Debug, Default)]
pub(super) struct EnvConfig {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub grpc_addr: Option<String>,
    pub http_addr: Option<String>,
    pub ws_addr: Option<String>,
    pub insecure: Option<bool>,
    pub fallback_enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub remove_ssml_tags: Option<bool>,
    pub auto_refresh_lease: Option<bool>,
}

impl EnvConfig {
    pub(super) fn load() -> TtsResult<Self> {
        Ok(Self {
            user_id: var("PLAYHT_USER_ID"),
            api_key: var("PLAYHT_API_KEY"),
            api_url: var("PLAYHT_API_URL"),
            grpc_addr: var("PLAYHT_GRPC_ADDR"),
            http_addr: var("PLAYHT_HTTP_ADDR"),
            ws_addr: var("PLAYHT_WS_ADDR"),
            insecure: parse_bool("PLAYHT_INSECURE")?,
            fallback_enabled: parse_bool("PLAYHT_FALLBACK_ENABLED")?,
            max_attempts: parse("PLAYHT_MAX_ATTEMPTS")?,
            remove_ssml_tags: parse_bool("PLAYHT_REMOVE_SSML_TAGS")?,
            auto_refresh_lease: parse_bool("PLAYHT_AUTO_REFRESH_LEASE")?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(key: &str) -> TtsResult<Option<T>> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| TtsError::Configuration(format!("Invalid value for {key}: '{raw}'"))),
        None => Ok(None),
    }
}

fn parse_bool(key: &str) -> TtsResult<Option<bool>> {
    match var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(TtsError::Configuration(format!(
                "Invalid boolean for {key}: '{raw}'"
            ))),
        },
        None => Ok(None),
    }
}
