//! Shared test doubles: a lease fetcher that counts calls and an adapter that plays back
//! scripted exchanges.

#![allow(dead_code)]

pub mod ws_server;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;

use stream_tts_client::{
    AdapterChannel, AudioChunk, ClientConfig, Endpoint, Lease, LeaseFetcher, Protocol,
    ProtocolAdapter, RetryConfig, StreamHandle, SynthesisRequest, TtsError, TtsResult,
};

/// Routes library logs to the test harness; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn lease_bytes(metadata: serde_json::Value) -> Vec<u8> {
    Lease::encode_raw(SystemTime::now(), Duration::from_secs(300), &metadata)
}

/// Config with fast retries and no background refresh.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("test-user", "test-key");
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        backoff_multiplier: 2.0,
    };
    config.connect_timeout = Duration::from_secs(2);
    config.read_timeout = Duration::from_secs(2);
    config
}

/// Returns a fresh lease on every fetch, optionally after a delay.
pub struct CountingFetcher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub metadata: serde_json::Value,
}

impl CountingFetcher {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            metadata: json!({}),
        })
    }

    /// Leases carrying `metadata`.
    pub fn with_metadata(metadata: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            metadata,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseFetcher for CountingFetcher {
    async fn fetch(&self) -> TtsResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Bytes::from(lease_bytes(self.metadata.clone())))
    }
}

/// What one `send` call does.
pub enum Script {
    /// `send` itself fails.
    Fail(TtsError),
    /// `send` succeeds and the handle yields these items, then closes.
    Items(Vec<TtsResult<AudioChunk>>),
}

impl Script {
    /// Audio chunks for `payloads` followed by a completion chunk.
    pub fn complete(payloads: &[&'static str]) -> Self {
        let mut items: Vec<TtsResult<AudioChunk>> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| Ok(AudioChunk::audio(i as u64, *p)))
            .collect();
        items.push(Ok(AudioChunk::complete(payloads.len() as u64)));
        Script::Items(items)
    }
}

/// Adapter that plays back one [`Script`] per `send`; once the scripts run out every
/// request completes with a single `"audio"` chunk.
///
/// A script's items are all queued before `send` returns.
pub struct ScriptedAdapter {
    protocol: Protocol,
    scripts: Mutex<VecDeque<Script>>,
    /// Sends on a channel to this address fail with a transport error.
    failing_address: Option<String>,
    pub opens: AtomicUsize,
    pub sends: AtomicUsize,
    pub texts: Mutex<Vec<Vec<String>>>,
    /// Address of the channel each `send` went to.
    pub sent_to: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(protocol: Protocol, scripts: Vec<Script>) -> Arc<Self> {
        Self::build(protocol, scripts, None)
    }

    /// Every send to `address` fails as unavailable; other addresses play scripts.
    pub fn failing_at(protocol: Protocol, address: &str) -> Arc<Self> {
        Self::build(protocol, Vec::new(), Some(address.to_string()))
    }

    fn build(protocol: Protocol, scripts: Vec<Script>, failing_address: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            scripts: Mutex::new(scripts.into()),
            failing_address,
            opens: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            sent_to: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent_to.lock().clone()
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<Vec<String>> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl ProtocolAdapter for ScriptedAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(&self, endpoint: &Endpoint, _lease: &Lease) -> TtsResult<AdapterChannel> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(AdapterChannel::Custom(Arc::new(endpoint.address.clone())))
    }

    async fn send(
        &self,
        channel: &AdapterChannel,
        request: SynthesisRequest,
        _lease: Arc<Lease>,
    ) -> TtsResult<StreamHandle> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().push(request.text.clone());

        let address = match channel {
            AdapterChannel::Custom(inner) => inner.downcast_ref::<String>().cloned(),
            _ => None,
        }
        .unwrap_or_default();
        self.sent_to.lock().push(address.clone());
        if self.failing_address.as_deref() == Some(address.as_str()) {
            return Err(TtsError::Transport(format!("Unavailable: {address} is overloaded")));
        }

        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::complete(&["audio"]));
        let items = match script {
            Script::Fail(e) => return Err(e),
            Script::Items(items) => items,
        };

        let (tx, handle) = StreamHandle::channel(items.len().max(1), &request.cancel);
        for item in items {
            if !tx.send(item).await {
                break;
            }
        }
        Ok(handle)
    }
}
