use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};

/// Fetches raw lease bytes from the control plane.
///
/// Errors are classified for the manager's retry loop: `Transport` is retried,
/// anything else ends the refresh.
#[async_trait]
pub trait LeaseFetcher: Send + Sync {
    async fn fetch(&self) -> TtsResult<Bytes>;
}

/// Fetches leases with `POST {api_url}/v2/leases`.
pub struct HttpLeaseFetcher {
    client: reqwest::Client,
    url: String,
    user_id: String,
    authorization: Zeroizing<String>,
}

impl HttpLeaseFetcher {
    pub fn new(config: &ClientConfig) -> TtsResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.lease_timeout)
            .build()
            .map_err(|e| TtsError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/v2/leases", config.api_url.trim_end_matches('/')),
            user_id: config.user_id.clone(),
            authorization: Zeroizing::new(config.bearer_token()),
        })
    }
}

#[async_trait]
impl LeaseFetcher for HttpLeaseFetcher {
    async fn fetch(&self) -> TtsResult<Bytes> {
        debug!(url = %self.url, "Requesting lease");
        let response = self
            .client
            .post(&self.url)
            .header("X-User-Id", &self.user_id)
            .header("Authorization", self.authorization.as_str())
            .send()
            .await
            .map_err(|e| TtsError::Transport(format!("lease request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .bytes()
                .await
                .map_err(|e| TtsError::Transport(format!("lease body read failed: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            s if s.is_server_error() => {
                TtsError::Transport(format!("lease endpoint returned {s}: {body}"))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TtsError::Authorization(format!("credentials rejected ({status}): {body}"))
            }
            s => TtsError::Authorization(format!("lease endpoint returned {s}: {body}")),
        })
    }
}
