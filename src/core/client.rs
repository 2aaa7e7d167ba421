//! Asynchronous synthesis client.
//!
//! [`Client`] validates a request, then hands back an [`AudioStream`] that performs the
//! network exchange lazily as it is polled. All clients built from one
//! [`ClientBuilder`] share a lease manager, a connection pool and a telemetry buffer.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use stream_tts_client::{Client, ClientConfig, Engine, RequestOptions};
//!
//! # async fn run() -> Result<(), stream_tts_client::TtsError> {
//! let client = Client::new(ClientConfig::from_env()?)?;
//! let options = RequestOptions::new("s3://voice-cloning-zero-shot/.../manifest.json");
//! let mut audio = client.synthesize("Hello there.", options, Engine::Play30Mini, None)?;
//! while let Some(chunk) = audio.next().await {
//!     let bytes = chunk?;
//!     println!("{} bytes", bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::{AdapterSet, ProtocolAdapter};
use super::engine::{Engine, EngineSelection};
use super::lease::{HttpLeaseFetcher, Lease, LeaseFetcher, LeaseManager, LeaseSettings};
use super::options::RequestOptions;
use super::pool::{ConnectionPool, PoolSettings};
use super::protocol::Protocol;
use super::session::{self, ByteStream, ClientCore, SessionPlan, SessionState, StateCell};
use super::telemetry::{RequestMetrics, Telemetry};
use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};
use crate::utils::text::{SentenceBatcher, TextInput, prepare_text, strip_ssml};

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Client`], optionally replacing the lease fetcher or adapters.
pub struct ClientBuilder {
    config: ClientConfig,
    fetcher: Option<Arc<dyn LeaseFetcher>>,
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            fetcher: None,
            adapters: Vec::new(),
        }
    }

    /// Fetches leases through `fetcher` instead of the control-plane endpoint.
    pub fn with_lease_fetcher(mut self, fetcher: Arc<dyn LeaseFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers `adapter` for its protocol, replacing the built-in one.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> TtsResult<Client> {
        let Self {
            config,
            fetcher,
            adapters: custom,
        } = self;
        config.validate()?;

        // Another component may have installed a provider already.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let fetcher: Arc<dyn LeaseFetcher> = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpLeaseFetcher::new(&config)?),
        };
        let mut adapters = AdapterSet::with_defaults(&config)?;
        for adapter in custom {
            adapters.register(adapter);
        }

        let leases = LeaseManager::new(fetcher, LeaseSettings::from_config(&config));
        let core = Arc::new(ClientCore {
            pool: ConnectionPool::new(PoolSettings::from_config(&config)),
            telemetry: Telemetry::new(config.metrics_buffer_size),
            leases,
            adapters,
            shutdown: CancellationToken::new(),
            config,
        });

        let refresh_task = if core.config.auto_refresh_lease {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(core.leases.spawn_auto_refresh(core.shutdown.child_token())),
                Err(_) => {
                    warn!("No tokio runtime available; background lease refresh disabled");
                    None
                }
            }
        } else {
            None
        };

        info!(
            user_id = %core.config.user_id,
            auto_refresh = refresh_task.is_some(),
            "Synthesis client ready"
        );
        Ok(Client {
            core,
            refresh_task: Arc::new(Mutex::new(refresh_task)),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Cooperative (async) synthesis client. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
    refresh_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.core.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> TtsResult<Self> {
        ClientBuilder::new(config).build()
    }

    /// Builds a client from `PLAYHT_*` environment variables.
    pub fn from_env() -> TtsResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// Starts a streaming synthesis.
    ///
    /// Validation happens here, before any network I/O. The returned stream does its
    /// work when polled.
    pub fn synthesize(
        &self,
        text: impl Into<TextInput>,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<AudioStream> {
        let (engine, protocol) = self.resolve(engine.into(), protocol, &options)?;
        let text = prepare_text(text.into(), self.core.config.remove_ssml_tags)?;
        Ok(self.start(
            "tts-request",
            text,
            Arc::new(options),
            engine,
            protocol,
            None,
        ))
    }

    /// Synthesizes `text` over HTTP and returns the whole payload.
    pub async fn synthesize_complete(
        &self,
        text: impl Into<TextInput>,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<Bytes> {
        let selection = engine.into();
        let resolved = selection.resolve(protocol)?;
        if resolved != Protocol::Http {
            return Err(TtsError::Validation(format!(
                "non-streaming synthesis is only available over http, not {resolved}"
            )));
        }
        self.synthesize(text, options, selection, Some(resolved))?
            .collect_bytes()
            .await
    }

    /// Synthesizes text that arrives as a stream of fragments.
    ///
    /// Over WebSocket every fragment goes to one duplex session as it arrives. Other
    /// protocols buffer fragments into sentences and synthesize each sentence in order.
    pub fn synthesize_text_stream<S>(
        &self,
        fragments: S,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<AudioStream>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let (engine, protocol) = self.resolve(engine.into(), protocol, &options)?;
        let options = Arc::new(options);
        let remove_ssml = self.core.config.remove_ssml_tags;

        if protocol.supports_incremental_input() {
            let (tx, rx) = mpsc::channel(self.core.config.chunk_buffer.max(1));
            let mut audio = self.start(
                "tts-stream-input",
                Vec::new(),
                options,
                engine,
                protocol,
                Some(rx),
            );
            audio.pump = Some(forward_fragments(fragments, tx, remove_ssml).boxed());
            return Ok(audio);
        }

        let request_id = Uuid::new_v4().to_string();
        let cancel = self.core.shutdown.child_token();
        let state = StateCell::new();
        let inner = sentence_sessions(
            self.core.clone(),
            fragments,
            SentencePlan {
                request_id: request_id.clone(),
                engine,
                protocol,
                options,
                remove_ssml,
            },
            cancel.clone(),
            state.clone(),
        );
        Ok(AudioStream::new(inner, request_id, protocol, cancel, state))
    }

    /// Returns a linked input sink and output stream.
    pub fn stream_pair(
        &self,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<(TextSink, AudioStream)> {
        let (tx, rx) = mpsc::channel::<String>(self.core.config.chunk_buffer.max(1));
        let fragments = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|text| (text, rx))
        });
        let audio = self.synthesize_text_stream(fragments, options, engine, protocol)?;
        Ok((TextSink { tx }, audio))
    }

    /// Acquires a lease ahead of the first request.
    pub async fn warmup(&self) -> TtsResult<Arc<Lease>> {
        self.ensure_open()?;
        let lease = self.core.leases.acquire().await?;
        debug!(expires_at = ?lease.expires_at(), "Client warmed up");
        Ok(lease)
    }

    /// Recent request records, oldest first.
    pub fn metrics(&self) -> Vec<RequestMetrics> {
        self.core.telemetry.snapshot()
    }

    /// The lease manager shared by this client's sessions.
    pub fn leases(&self) -> &LeaseManager {
        &self.core.leases
    }

    /// Stops background refresh, cancels running sessions and drops pooled channels.
    pub fn close(&self) {
        if self.core.shutdown.is_cancelled() {
            return;
        }
        self.core.shutdown.cancel();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.core.pool.close();
        info!("Synthesis client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> TtsResult<()> {
        if self.is_closed() {
            return Err(TtsError::Configuration("client is closed".to_string()));
        }
        Ok(())
    }

    fn resolve(
        &self,
        selection: EngineSelection,
        protocol: Option<Protocol>,
        options: &RequestOptions,
    ) -> TtsResult<(Engine, Protocol)> {
        self.ensure_open()?;
        let protocol = selection.resolve(protocol)?;
        options.validate_for(selection.engine, protocol)?;
        Ok((selection.engine, protocol))
    }

    fn start(
        &self,
        operation: &'static str,
        text: Vec<String>,
        options: Arc<RequestOptions>,
        engine: Engine,
        protocol: Protocol,
        follow_up: Option<mpsc::Receiver<String>>,
    ) -> AudioStream {
        let request_id = Uuid::new_v4().to_string();
        let cancel = self.core.shutdown.child_token();
        let state = StateCell::new();
        debug!(
            request_id = %request_id,
            engine = %engine,
            protocol = %protocol,
            "Starting synthesis"
        );
        let plan = SessionPlan {
            operation,
            request_id: request_id.clone(),
            engine,
            protocol,
            text,
            options,
            follow_up,
        };
        let inner = session::drive(self.core.clone(), plan, cancel.clone(), state.clone());
        AudioStream::new(inner, request_id, protocol, cancel, state)
    }
}

async fn forward_fragments<S>(fragments: S, tx: mpsc::Sender<String>, remove_ssml: bool)
where
    S: Stream<Item = String> + Send + 'static,
{
    let mut fragments = Box::pin(fragments);
    while let Some(fragment) = fragments.next().await {
        let fragment = if remove_ssml {
            strip_ssml(&fragment)
        } else {
            fragment
        };
        if fragment.trim().is_empty() {
            continue;
        }
        if tx.send(fragment).await.is_err() {
            break;
        }
    }
}

struct SentencePlan {
    request_id: String,
    engine: Engine,
    protocol: Protocol,
    options: Arc<RequestOptions>,
    remove_ssml: bool,
}

fn sentence_sessions<S>(
    core: Arc<ClientCore>,
    fragments: S,
    plan: SentencePlan,
    cancel: CancellationToken,
    state: StateCell,
) -> ByteStream
where
    S: Stream<Item = String> + Send + 'static,
{
    Box::pin(stream! {
        let mut fragments = Box::pin(fragments);
        let mut batcher = SentenceBatcher::new();
        let mut sentence_index = 0usize;
        state.enter(&plan.request_id, SessionState::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state.enter(&plan.request_id, SessionState::Canceled);
                    return;
                }
                next = fragments.next() => next,
            };
            let (sentence, last) = match next {
                Some(fragment) => match batcher.push(&fragment) {
                    Some(sentence) => (sentence, false),
                    None => continue,
                },
                None => match batcher.finish() {
                    Some(sentence) => (sentence, true),
                    None => break,
                },
            };

            let sentence = if plan.remove_ssml { strip_ssml(&sentence) } else { sentence };
            if sentence.trim().is_empty() {
                if last {
                    break;
                }
                continue;
            }
            let text = match prepare_text(sentence.into(), false) {
                Ok(text) => text,
                Err(e) => {
                    state.enter(&plan.request_id, SessionState::Failed);
                    yield Err(e);
                    return;
                }
            };
            let session_plan = SessionPlan {
                operation: "tts-stream-input",
                request_id: format!("{}-{sentence_index}", plan.request_id),
                engine: plan.engine,
                protocol: plan.protocol,
                text,
                options: plan.options.clone(),
                follow_up: None,
            };
            sentence_index += 1;

            let mut audio = session::drive(core.clone(), session_plan, cancel.child_token(), StateCell::new());
            while let Some(item) = audio.next().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    state.enter(&plan.request_id, SessionState::Failed);
                    return;
                }
            }
            if cancel.is_cancelled() {
                state.enter(&plan.request_id, SessionState::Canceled);
                return;
            }
            if last {
                break;
            }
        }
        state.enter(&plan.request_id, SessionState::Complete);
    })
}

// =============================================================================
// Streams and handles
// =============================================================================

/// Cancels an [`AudioStream`] from anywhere, including another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Ordered audio for one request.
///
/// Yields payloads in sequence order and then ends, or yields one error and ends.
/// Canceling (or dropping) the stream aborts the exchange; the stream then ends without
/// an error.
pub struct AudioStream {
    inner: ByteStream,
    /// Feeds caller text into a duplex session; polled alongside `inner`.
    pump: Option<BoxFuture<'static, ()>>,
    request_id: String,
    protocol: Protocol,
    cancel: CancellationToken,
    state: StateCell,
    done: bool,
}

impl AudioStream {
    fn new(
        inner: ByteStream,
        request_id: String,
        protocol: Protocol,
        cancel: CancellationToken,
        state: StateCell,
    ) -> Self {
        Self {
            inner,
            pump: None,
            request_id,
            protocol,
            cancel,
            state,
            done: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Aborts the exchange and discards anything buffered.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if tokio::runtime::Handle::try_current().is_ok() {
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            self.wind_down(&mut cx);
        } else {
            self.pump = None;
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drains the stream into one buffer.
    pub async fn collect_bytes(mut self) -> TtsResult<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Lets the session observe the cancellation once so it can hand its channel
    /// back to the pool, then drops it.
    fn wind_down(&mut self, cx: &mut Context<'_>) {
        self.pump = None;
        if !self.done {
            self.done = true;
            let _ = self.inner.as_mut().poll_next(cx);
            self.inner = Box::pin(futures::stream::empty());
        }
        self.state.enter(&self.request_id, SessionState::Canceled);
    }
}

impl Stream for AudioStream {
    type Item = TtsResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            this.wind_down(cx);
            return Poll::Ready(None);
        }
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(pump) = this.pump.as_mut()
            && pump.as_mut().poll(cx).is_ready()
        {
            this.pump = None;
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                this.pump = None;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                this.pump = None;
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("request_id", &self.request_id)
            .field("protocol", &self.protocol)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Input half of [`Client::stream_pair`].
#[derive(Debug)]
pub struct TextSink {
    tx: mpsc::Sender<String>,
}

impl TextSink {
    /// Queues one text fragment, waiting while the input buffer is full.
    pub async fn send(&self, text: impl Into<String>) -> TtsResult<()> {
        self.tx
            .send(text.into())
            .await
            .map_err(|_| TtsError::Validation("audio stream has ended; input is closed".to_string()))
    }

    /// Blocking variant of [`send`](Self::send) for thread-driven callers.
    pub fn blocking_send(&self, text: impl Into<String>) -> TtsResult<()> {
        self.tx
            .blocking_send(text.into())
            .map_err(|_| TtsError::Validation("audio stream has ended; input is closed".to_string()))
    }

    /// Closes the input. Audio for text already sent keeps flowing.
    pub fn done(self) {}
}
