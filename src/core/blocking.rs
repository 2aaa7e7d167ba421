//! Thread-driven client.
//!
//! [`BlockingClient`] owns a multi-thread tokio runtime. Network I/O runs on its worker
//! threads; the caller pulls audio from a bounded queue with a blocking receive.
//! None of these methods may be called from inside an async context.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::debug;

use super::client::{AudioStream, CancelHandle, Client, ClientBuilder, TextSink};
use super::engine::EngineSelection;
use super::options::RequestOptions;
use super::protocol::Protocol;
use super::session::{SessionState, StateCell};
use super::telemetry::RequestMetrics;
use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};
use crate::utils::text::TextInput;

pub struct BlockingClient {
    runtime: Arc<Runtime>,
    client: Client,
}

impl BlockingClient {
    pub fn new(config: ClientConfig) -> TtsResult<Self> {
        Self::from_builder(ClientBuilder::new(config))
    }

    pub fn from_env() -> TtsResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Builds the runtime first so background tasks started by the client land on it.
    pub fn from_builder(builder: ClientBuilder) -> TtsResult<Self> {
        let mut runtime = tokio::runtime::Builder::new_multi_thread();
        runtime.enable_all().thread_name("tts-client-io");
        if let Some(threads) = builder.config().worker_threads {
            runtime.worker_threads(threads);
        }
        let runtime = runtime
            .build()
            .map_err(|e| TtsError::Configuration(format!("Failed to start runtime: {e}")))?;

        let client = {
            let _guard = runtime.enter();
            builder.build()?
        };
        Ok(Self {
            runtime: Arc::new(runtime),
            client,
        })
    }

    /// The async client driven by this runtime.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn synthesize(
        &self,
        text: impl Into<TextInput>,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<BlockingAudioStream> {
        let audio = self.client.synthesize(text, options, engine, protocol)?;
        Ok(self.drive(audio))
    }

    pub fn synthesize_complete(
        &self,
        text: impl Into<TextInput>,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<Bytes> {
        self.runtime
            .block_on(self.client.synthesize_complete(text, options, engine, protocol))
    }

    /// Synthesizes text produced by an iterator, see [`Client::synthesize_text_stream`].
    pub fn synthesize_text_iter<I>(
        &self,
        fragments: I,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<BlockingAudioStream>
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        let fragments = futures::stream::iter(fragments);
        let audio = self
            .client
            .synthesize_text_stream(fragments, options, engine, protocol)?;
        Ok(self.drive(audio))
    }

    /// Linked input sink and output iterator; use [`TextSink::blocking_send`] to feed it.
    pub fn stream_pair(
        &self,
        options: RequestOptions,
        engine: impl Into<EngineSelection>,
        protocol: Option<Protocol>,
    ) -> TtsResult<(TextSink, BlockingAudioStream)> {
        let (sink, audio) = self.client.stream_pair(options, engine, protocol)?;
        Ok((sink, self.drive(audio)))
    }

    pub fn warmup(&self) -> TtsResult<()> {
        self.runtime.block_on(self.client.warmup()).map(|_| ())
    }

    pub fn metrics(&self) -> Vec<RequestMetrics> {
        self.client.metrics()
    }

    pub fn close(&self) {
        self.client.close();
    }

    fn drive(&self, mut audio: AudioStream) -> BlockingAudioStream {
        let (tx, rx) = mpsc::channel(self.client.config().chunk_buffer.max(1));
        let cancel = audio.cancel_handle();
        let request_id = audio.request_id().to_string();
        let state = audio.state_cell();
        self.runtime.spawn(async move {
            while let Some(item) = audio.next().await {
                if tx.send(item).await.is_err() {
                    audio.cancel();
                    break;
                }
            }
            debug!(request_id = %audio.request_id(), "Blocking stream pump finished");
        });
        BlockingAudioStream {
            rx,
            cancel,
            request_id,
            state,
            _runtime: self.runtime.clone(),
        }
    }
}

/// Iterator over one request's audio for thread-driven callers.
pub struct BlockingAudioStream {
    rx: mpsc::Receiver<TtsResult<Bytes>>,
    cancel: CancelHandle,
    request_id: String,
    state: StateCell,
    _runtime: Arc<Runtime>,
}

impl BlockingAudioStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Aborts the exchange; the iterator ends on the next call without an error.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drains the iterator into one buffer.
    pub fn collect_bytes(self) -> TtsResult<Bytes> {
        let mut buffer = bytes::BytesMut::new();
        for chunk in self {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl Iterator for BlockingAudioStream {
    type Item = TtsResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_canceled() {
            return None;
        }
        self.rx.blocking_recv()
    }
}

impl fmt::Debug for BlockingAudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingAudioStream")
            .field("request_id", &self.request_id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Drop for BlockingAudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
