//! Chunked HTTP adapter.
//!
//! One POST per request; each body fragment becomes one chunk and the end of the body
//! becomes the terminal chunk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};

use super::{
    AdapterChannel, AdapterSettings, ChunkSender, Endpoint, ProtocolAdapter, StreamHandle,
    SynthesisRequest,
};
use crate::core::chunk::AudioChunk;
use crate::core::lease::Lease;
use crate::core::messages::{ApiErrorBody, HttpTtsRequest, SynthesisParams};
use crate::core::protocol::Protocol;
use crate::errors::{TtsError, TtsResult};

pub struct HttpAdapter {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(settings: AdapterSettings) -> TtsResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| TtsError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { settings, client })
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn open(&self, endpoint: &Endpoint, _lease: &Lease) -> TtsResult<AdapterChannel> {
        let url = url::Url::parse(&endpoint.address).map_err(|e| {
            TtsError::Configuration(format!("Invalid HTTP address '{}': {e}", endpoint.address))
        })?;
        Ok(AdapterChannel::Http {
            client: self.client.clone(),
            url,
        })
    }

    async fn send(
        &self,
        channel: &AdapterChannel,
        request: SynthesisRequest,
        lease: Arc<Lease>,
    ) -> TtsResult<StreamHandle> {
        let AdapterChannel::Http { client, url } = channel else {
            return Err(TtsError::Configuration(
                "HTTP adapter was handed a non-HTTP channel".to_string(),
            ));
        };

        let body = HttpTtsRequest::new(
            request.text,
            SynthesisParams::from_options(&request.options, request.engine),
        );
        let builder = client
            .post(url.clone())
            .header("X-User-Id", &self.settings.user_id)
            .header(AUTHORIZATION, format!("Lease {}", lease.to_base64()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, request.options.format.content_type())
            .json(&body);

        let (tx, handle) = StreamHandle::channel(self.settings.chunk_buffer, &request.cancel);
        let read_timeout = self.settings.read_timeout;
        let request_id = request.request_id;
        tokio::spawn(async move {
            debug!(request_id = %request_id, "Starting HTTP exchange");
            run_exchange(builder, tx, read_timeout).await;
            debug!(request_id = %request_id, "HTTP exchange finished");
        });

        Ok(handle)
    }
}

async fn run_exchange(builder: reqwest::RequestBuilder, tx: ChunkSender, read_timeout: Duration) {
    let cancel = tx.cancel_token().clone();

    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = tokio::time::timeout(read_timeout, builder.send()) => r,
    };
    let response = match sent {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tx.send(Err(TtsError::Transport(format!("HTTP request failed: {e}"))))
                .await;
            return;
        }
        Err(_) => {
            tx.send(Err(TtsError::timeout("HTTP request", read_timeout))).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::time::timeout(read_timeout, response.bytes())
            .await
            .ok()
            .and_then(Result::ok);
        tx.send(Err(error_from_response(status.as_u16(), body.as_deref())))
            .await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut sequence = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("HTTP body read canceled");
                return;
            }
            r = tokio::time::timeout(read_timeout, body.next()) => r,
        };
        match next {
            Err(_) => {
                tx.send(Err(TtsError::timeout("HTTP body read", read_timeout))).await;
                return;
            }
            Ok(Some(Ok(bytes))) => {
                if bytes.is_empty() {
                    continue;
                }
                if !tx.send(Ok(AudioChunk::audio(sequence, bytes))).await {
                    return;
                }
                sequence += 1;
            }
            Ok(Some(Err(e))) => {
                tx.send(Err(TtsError::Transport(format!("HTTP body read failed: {e}"))))
                    .await;
                return;
            }
            Ok(None) => {
                tx.send(Ok(AudioChunk::complete(sequence))).await;
                return;
            }
        }
    }
}

/// Converts a failed HTTP status and body into the error taxonomy.
pub fn error_from_response(status: u16, body: Option<&[u8]>) -> TtsError {
    let api_error = body.and_then(|b| serde_json::from_slice::<ApiErrorBody>(b).ok());
    let detail = api_error
        .as_ref()
        .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
        .or_else(|| {
            body.map(|b| String::from_utf8_lossy(b).trim().to_string())
                .filter(|s| !s.is_empty())
        });

    if let Some(err) = &api_error {
        warn!(status, error_message = ?err.message, error_code = ?err.code, "Synthesis API error");
    }

    match (status, detail) {
        (401 | 403, Some(d)) => TtsError::Authorization(format!("lease rejected ({status}): {d}")),
        (401 | 403, None) => TtsError::Authorization(format!("lease rejected ({status})")),
        (429 | 502 | 503 | 504, Some(d)) => {
            TtsError::Transport(format!("service unavailable ({status}): {d}"))
        }
        (429 | 502 | 503 | 504, None) => {
            TtsError::Transport(format!("service unavailable ({status})"))
        }
        (_, Some(d)) => TtsError::server(Some(status as i32), d),
        (_, None) => TtsError::server(
            Some(status as i32),
            format!("request failed with status {status}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_response_classes() {
        assert!(matches!(
            error_from_response(401, None),
            TtsError::Authorization(_)
        ));
        assert!(matches!(
            error_from_response(503, Some(b"overloaded")),
            TtsError::Transport(m) if m.contains("overloaded")
        ));
        assert_eq!(
            error_from_response(400, Some(br#"{"error_message":"voice not found"}"#)),
            TtsError::Server {
                code: Some(400),
                messages: vec!["voice not found".into()]
            }
        );
        assert_eq!(
            error_from_response(500, Some(b"")),
            TtsError::Server {
                code: Some(500),
                messages: vec!["request failed with status 500".into()]
            }
        );
    }
}
