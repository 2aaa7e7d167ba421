//! gRPC adapter.
//!
//! Uses tonic's low-level `Grpc` client with a prost codec against the server-streaming
//! `Tts` method. One channel carries any number of concurrent calls.
//!
//! ## Service Definition
//!
//! ```protobuf
//! service Tts {
//!     rpc Tts(TtsRequest) returns (stream TtsResponse);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::Streaming;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint as TonicEndpoint};
use tracing::{debug, info, warn};

use super::{
    AdapterChannel, AdapterSettings, ChunkSender, Endpoint, ProtocolAdapter, StreamHandle,
    SynthesisRequest,
};
use crate::core::chunk::{AudioChunk, ChunkStatus};
use crate::core::lease::Lease;
use crate::core::messages::{StatusCode, TtsParams, TtsRequest, TtsResponse};
use crate::core::protocol::Protocol;
use crate::errors::{TtsError, TtsResult};

/// gRPC service path for Tts.Tts
const GRPC_SERVICE_PATH: &str = "/playht.v1.Tts/Tts";

/// Addresses containing this marker are served without TLS.
const ON_PREM_MARKER: &str = "on-prem.play.ht";

pub struct GrpcAdapter {
    settings: AdapterSettings,
}

impl GrpcAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn is_insecure(&self, address: &str) -> bool {
        self.settings.insecure || address.contains(ON_PREM_MARKER)
    }
}

/// Builds the channel URI for a `host:port` (or full URI) address.
fn channel_uri(address: &str, insecure: bool) -> String {
    if address.contains("://") {
        address.to_string()
    } else if insecure {
        format!("http://{address}")
    } else {
        format!("https://{address}")
    }
}

fn host_of(address: &str) -> &str {
    let without_scheme = address.split("://").last().unwrap_or(address);
    without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme)
}

#[async_trait]
impl ProtocolAdapter for GrpcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    async fn open(&self, endpoint: &Endpoint, _lease: &Lease) -> TtsResult<AdapterChannel> {
        let insecure = self.is_insecure(&endpoint.address);
        let uri = channel_uri(&endpoint.address, insecure);

        let mut builder = TonicEndpoint::from_shared(uri.clone())
            .map_err(|e| TtsError::Configuration(format!("Invalid gRPC address '{uri}': {e}")))?
            .connect_timeout(self.settings.connect_timeout)
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_while_idle(true);

        if !insecure {
            let tls = ClientTlsConfig::new().domain_name(host_of(&endpoint.address));
            builder = builder
                .tls_config(tls)
                .map_err(|e| TtsError::Configuration(format!("TLS config error: {e}")))?;
        }

        let channel = builder
            .connect()
            .await
            .map_err(|e| TtsError::Transport(format!("gRPC connection failed: {e}")))?;

        info!(endpoint = %endpoint, insecure, "Connected gRPC channel");
        Ok(AdapterChannel::Grpc(channel))
    }

    async fn send(
        &self,
        channel: &AdapterChannel,
        request: SynthesisRequest,
        lease: Arc<Lease>,
    ) -> TtsResult<StreamHandle> {
        let AdapterChannel::Grpc(channel) = channel else {
            return Err(TtsError::Configuration(
                "gRPC adapter was handed a non-gRPC channel".to_string(),
            ));
        };

        let (tx, handle) = StreamHandle::channel(self.settings.chunk_buffer, &request.cancel);
        let message = TtsRequest {
            lease: lease.data().to_vec(),
            params: Some(TtsParams::from_options(request.text, &request.options)),
        };
        let channel = channel.clone();
        let read_timeout = self.settings.read_timeout;
        let request_id = request.request_id;

        tokio::spawn(async move {
            debug!(request_id = %request_id, "Starting gRPC call");
            run_call(channel, message, tx, read_timeout).await;
            debug!(request_id = %request_id, "gRPC call finished");
        });

        Ok(handle)
    }
}

/// Perform the Tts call using tonic's low-level Grpc client
async fn start_call(channel: Channel, message: TtsRequest) -> TtsResult<Streaming<TtsResponse>> {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| TtsError::Transport(format!("gRPC channel not ready: {e}")))?;

    let codec: ProstCodec<TtsRequest, TtsResponse> = ProstCodec::default();
    let path = PathAndQuery::from_static(GRPC_SERVICE_PATH);
    let response = grpc
        .server_streaming(tonic::Request::new(message), path, codec)
        .await?;
    Ok(response.into_inner())
}

async fn run_call(channel: Channel, message: TtsRequest, tx: ChunkSender, read_timeout: Duration) {
    let cancel = tx.cancel_token().clone();

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = tokio::time::timeout(read_timeout, start_call(channel, message)) => r,
    };
    let mut stream = match started {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tx.send(Err(e)).await;
            return;
        }
        Err(_) => {
            tx.send(Err(TtsError::timeout("gRPC call setup", read_timeout))).await;
            return;
        }
    };

    let mut sequencer = Sequencer::default();
    loop {
        let next = tokio::select! {
            biased;
            // Dropping the stream resets the HTTP/2 stream on the shared channel.
            _ = cancel.cancelled() => {
                debug!("gRPC stream canceled");
                return;
            }
            r = tokio::time::timeout(read_timeout, stream.message()) => r,
        };

        match next {
            Err(_) => {
                tx.send(Err(TtsError::timeout("gRPC read", read_timeout))).await;
                return;
            }
            Ok(Err(status)) if status.code() == tonic::Code::Cancelled => {
                tx.send(Ok(AudioChunk::canceled(sequencer.next_local()))).await;
                return;
            }
            Ok(Err(status)) => {
                warn!(code = ?status.code(), message = %status.message(), "gRPC stream failed");
                tx.send(Err(status.into())).await;
                return;
            }
            Ok(Ok(None)) => {
                tx.send(Ok(AudioChunk::complete(sequencer.next_local()))).await;
                return;
            }
            Ok(Ok(Some(response))) => {
                let chunk = sequencer.to_chunk(response);
                let terminal = chunk.status.is_terminal();
                if !tx.send(Ok(chunk)).await || terminal {
                    return;
                }
            }
        }
    }
}

/// Rebases server sequence numbers so the first response is 0.
#[derive(Debug, Default)]
struct Sequencer {
    base: Option<i64>,
    last: Option<u64>,
}

impl Sequencer {
    fn next_local(&self) -> u64 {
        self.last.map_or(0, |l| l.saturating_add(1))
    }

    fn to_chunk(&mut self, response: TtsResponse) -> AudioChunk {
        let base = *self.base.get_or_insert(response.sequence);
        let sequence = response
            .sequence
            .checked_sub(base)
            .and_then(|d| u64::try_from(d).ok())
            .unwrap_or(u64::MAX);
        self.last = Some(sequence);

        let status = match response.status {
            None => ChunkStatus::InProgress,
            Some(status) => match status.code() {
                StatusCode::Unspecified | StatusCode::InProgress => ChunkStatus::InProgress,
                StatusCode::Complete => ChunkStatus::Complete,
                StatusCode::Canceled => ChunkStatus::Canceled,
                StatusCode::Error => ChunkStatus::Error {
                    code: None,
                    messages: status.description,
                },
            },
        };

        AudioChunk {
            sequence,
            payload: response.data,
            status,
        }
    }
}
