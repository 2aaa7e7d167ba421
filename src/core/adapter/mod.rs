//! Protocol adapters.
//!
//! Every wire protocol implements [`ProtocolAdapter`]: open a channel to an endpoint,
//! send one request on it and hand back a [`StreamHandle`] of ordered [`AudioChunk`]s.
//! Adapters are looked up by [`Protocol`] in an [`AdapterSet`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chunk::AudioChunk;
use super::engine::Engine;
use super::lease::Lease;
use super::options::RequestOptions;
use super::protocol::Protocol;
use crate::config::{ClientConfig, DEFAULT_GRPC_ADDR, DEFAULT_HTTP_URL};
use crate::errors::{TtsError, TtsResult};

pub mod grpc;
pub mod http;
pub mod websocket;

pub use grpc::GrpcAdapter;
pub use http::HttpAdapter;
pub use websocket::{WebSocketAdapter, WsConnection};

// =============================================================================
// Endpoint
// =============================================================================

/// Where a channel connects: one pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub address: String,
}

impl Endpoint {
    pub fn new(protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
        }
    }

    /// Picks the address for `protocol`: configured override, then lease metadata,
    /// then the built-in default.
    pub fn resolve(protocol: Protocol, config: &ClientConfig, lease: &Lease) -> TtsResult<Self> {
        let meta = lease.metadata();
        let address = match protocol {
            Protocol::Grpc => config
                .grpc_addr
                .clone()
                .or_else(|| meta.inference_address.clone())
                .unwrap_or_else(|| DEFAULT_GRPC_ADDR.to_string()),
            Protocol::Http => config
                .http_addr
                .clone()
                .or_else(|| meta.http_address.clone())
                .unwrap_or_else(|| DEFAULT_HTTP_URL.to_string()),
            Protocol::WebSocket => config
                .ws_addr
                .clone()
                .or_else(|| meta.websocket_address.clone())
                .ok_or_else(|| {
                    TtsError::Configuration(
                        "no WebSocket address configured and none carried by the lease"
                            .to_string(),
                    )
                })?,
        };
        Ok(Self::new(protocol, address))
    }

    /// The lease's inference address when fallback is enabled and `grpc_addr`
    /// overrides it with a different address.
    pub fn grpc_fallback(config: &ClientConfig, lease: &Lease) -> Option<Self> {
        if !config.fallback_enabled {
            return None;
        }
        let primary = config.grpc_addr.as_deref()?;
        let fallback = lease.metadata().inference_address.as_deref()?;
        (fallback != primary).then(|| Self::new(Protocol::Grpc, fallback))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

// =============================================================================
// Channels and requests
// =============================================================================

/// A live connection produced by [`ProtocolAdapter::open`].
#[derive(Clone)]
pub enum AdapterChannel {
    /// Multiplexed HTTP/2 channel; cheap to clone.
    Grpc(tonic::transport::Channel),
    /// HTTP client bound to one streaming URL.
    Http {
        client: reqwest::Client,
        url: url::Url,
    },
    /// One WebSocket connection, used by one session at a time.
    WebSocket(Arc<WsConnection>),
    /// Channel state owned by a custom adapter.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl AdapterChannel {
    /// Whether the underlying connection can still carry a session.
    pub fn is_open(&self) -> bool {
        match self {
            Self::WebSocket(conn) => conn.is_open(),
            _ => true,
        }
    }
}

impl fmt::Debug for AdapterChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grpc(_) => f.write_str("AdapterChannel::Grpc"),
            Self::Http { url, .. } => write!(f, "AdapterChannel::Http({url})"),
            Self::WebSocket(conn) => write!(f, "AdapterChannel::WebSocket(open={})", conn.is_open()),
            Self::Custom(_) => f.write_str("AdapterChannel::Custom"),
        }
    }
}

/// One synthesis exchange as handed to an adapter.
pub struct SynthesisRequest {
    pub request_id: String,
    pub engine: Engine,
    pub text: Vec<String>,
    pub options: Arc<RequestOptions>,
    /// Follow-up text fragments for duplex sessions; closed when input ends.
    pub follow_up: Option<mpsc::Receiver<String>>,
    /// Session cancellation; adapters derive their stream token from it.
    pub cancel: CancellationToken,
}

impl fmt::Debug for SynthesisRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisRequest")
            .field("request_id", &self.request_id)
            .field("engine", &self.engine)
            .field("segments", &self.text.len())
            .field("duplex", &self.follow_up.is_some())
            .finish()
    }
}

/// Timeouts and buffer sizes shared by the built-in adapters.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub chunk_buffer: usize,
    pub insecure: bool,
    /// Sent as `X-User-Id` alongside the lease on HTTP requests.
    pub user_id: String,
}

impl AdapterSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            chunk_buffer: config.chunk_buffer.max(1),
            insecure: config.insecure,
            user_id: config.user_id.clone(),
        }
    }
}

// =============================================================================
// Stream handle
// =============================================================================

/// Producer half of a [`StreamHandle`], held by an adapter's I/O task.
pub struct ChunkSender {
    tx: mpsc::Sender<TtsResult<AudioChunk>>,
    cancel: CancellationToken,
}

impl ChunkSender {
    /// Pushes one item, waiting for buffer space. Returns `false` once the consumer is
    /// gone or the stream was canceled; the caller should stop reading the network.
    pub async fn send(&self, item: TtsResult<AudioChunk>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Finite, non-restartable sequence of chunks for one exchange.
///
/// Dropping the handle or calling [`cancel`](Self::cancel) aborts the adapter's I/O and
/// discards anything still buffered.
pub struct StreamHandle {
    rx: mpsc::Receiver<TtsResult<AudioChunk>>,
    cancel: CancellationToken,
}

impl StreamHandle {
    /// Creates a linked sender/handle pair with a bounded buffer of `buffer` items.
    pub fn channel(buffer: usize, parent: &CancellationToken) -> (ChunkSender, StreamHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = parent.child_token();
        (
            ChunkSender {
                tx,
                cancel: cancel.clone(),
            },
            StreamHandle { rx, cancel },
        )
    }

    /// Receives the next chunk; `None` once the adapter finished or the handle was canceled.
    pub async fn receive(&mut self) -> Option<TtsResult<AudioChunk>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Takes an already-queued item without waiting.
    pub fn try_receive(&mut self) -> Option<TtsResult<AudioChunk>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for StreamHandle {
    type Item = TtsResult<AudioChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Adapter trait and registry
// =============================================================================

/// Capability shared by all wire protocols.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Opens a channel to `endpoint`. Callers bound this with the connect timeout.
    async fn open(&self, endpoint: &Endpoint, lease: &Lease) -> TtsResult<AdapterChannel>;

    /// Starts one exchange on `channel`. Failures after this returns arrive as `Err`
    /// items on the handle.
    async fn send(
        &self,
        channel: &AdapterChannel,
        request: SynthesisRequest,
        lease: Arc<Lease>,
    ) -> TtsResult<StreamHandle>;
}

/// Adapters keyed by protocol.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Protocol, Arc<dyn ProtocolAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// gRPC, HTTP and WebSocket adapters configured from `config`.
    pub fn with_defaults(config: &ClientConfig) -> TtsResult<Self> {
        let settings = AdapterSettings::from_config(config);
        let mut set = Self::new();
        set.register(Arc::new(GrpcAdapter::new(settings.clone())));
        set.register(Arc::new(HttpAdapter::new(settings.clone())?));
        set.register(Arc::new(WebSocketAdapter::new(settings)));
        Ok(set)
    }

    /// Registers `adapter` for its protocol, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    pub fn get(&self, protocol: Protocol) -> TtsResult<Arc<dyn ProtocolAdapter>> {
        self.adapters.get(&protocol).cloned().ok_or_else(|| {
            TtsError::Configuration(format!("no adapter registered for protocol {protocol}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::SystemTime;

    fn lease(meta: serde_json::Value) -> Lease {
        Lease::parse(Bytes::from(Lease::encode_raw(
            SystemTime::now(),
            Duration::from_secs(60),
            &meta,
        )))
        .unwrap()
    }

    #[test]
    fn test_endpoint_resolution_order() {
        let mut config = ClientConfig::new("u", "k");
        let lease = lease(json!({
            "inference_address": "lease-grpc:443",
            "websocket_address": "wss://lease-ws/tts"
        }));

        let grpc = Endpoint::resolve(Protocol::Grpc, &config, &lease).unwrap();
        assert_eq!(grpc.address, "lease-grpc:443");

        config.grpc_addr = Some("override:50051".into());
        let grpc = Endpoint::resolve(Protocol::Grpc, &config, &lease).unwrap();
        assert_eq!(grpc.address, "override:50051");

        let http = Endpoint::resolve(Protocol::Http, &config, &lease).unwrap();
        assert_eq!(http.address, DEFAULT_HTTP_URL);

        let ws = Endpoint::resolve(Protocol::WebSocket, &config, &lease).unwrap();
        assert_eq!(ws.address, "wss://lease-ws/tts");
    }

    #[test]
    fn test_grpc_fallback_needs_a_distinct_override() {
        let leased = lease(json!({"inference_address": "lease-grpc:443"}));
        let mut config = ClientConfig::new("u", "k");
        config.grpc_addr = Some("on-prem:11045".into());
        assert!(Endpoint::grpc_fallback(&config, &leased).is_none());

        config.fallback_enabled = true;
        assert_eq!(
            Endpoint::grpc_fallback(&config, &leased),
            Some(Endpoint::new(Protocol::Grpc, "lease-grpc:443"))
        );

        config.grpc_addr = Some("lease-grpc:443".into());
        assert!(Endpoint::grpc_fallback(&config, &leased).is_none());

        config.grpc_addr = None;
        assert!(Endpoint::grpc_fallback(&config, &leased).is_none());

        config.grpc_addr = Some("on-prem:11045".into());
        assert!(Endpoint::grpc_fallback(&config, &lease(json!({}))).is_none());
    }

    #[test]
    fn test_websocket_without_address_is_configuration_error() {
        let config = ClientConfig::new("u", "k");
        let err = Endpoint::resolve(Protocol::WebSocket, &config, &lease(json!({}))).unwrap_err();
        assert!(matches!(err, TtsError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_stream_handle_cancel_drops_buffered() {
        let parent = CancellationToken::new();
        let (tx, mut handle) = StreamHandle::channel(4, &parent);
        assert!(tx.send(Ok(AudioChunk::audio(0, "a"))).await);
        assert!(tx.send(Ok(AudioChunk::audio(1, "b"))).await);
        handle.cancel();
        assert!(handle.receive().await.is_none());
        assert!(handle.try_receive().is_none());
        assert!(!tx.send(Ok(AudioChunk::audio(2, "c"))).await);
        assert!(tx.is_canceled());
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let (tx, mut handle) = StreamHandle::channel(1, &parent);
        parent.cancel();
        assert!(tx.is_canceled());
        assert!(handle.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_backpressure_blocks_producer() {
        let parent = CancellationToken::new();
        let (tx, mut handle) = StreamHandle::channel(1, &parent);
        assert!(tx.send(Ok(AudioChunk::audio(0, "a"))).await);
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            tx.send(Ok(AudioChunk::audio(1, "b"))),
        )
        .await;
        assert!(blocked.is_err());
        assert!(handle.receive().await.is_some());
    }

    #[test]
    fn test_missing_adapter() {
        let set = AdapterSet::new();
        assert!(matches!(
            set.get(Protocol::Grpc),
            Err(TtsError::Configuration(_))
        ));
    }
}
