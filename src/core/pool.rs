//! Channel pool keyed by endpoint.
//!
//! Multiplexed (gRPC) channels are opened once per endpoint and shared by every session.
//! Other channels serve one session at a time: a per-endpoint semaphore caps concurrent
//! sessions and released healthy channels wait in an idle list for reuse.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::adapter::{AdapterChannel, Endpoint, ProtocolAdapter};
use super::lease::Lease;
use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};

/// Pool limits and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_per_endpoint: usize,
    pub max_idle: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_endpoint: 8,
            max_idle: 4,
            idle_timeout: Duration::from_secs(90),
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_per_endpoint: config.pool_max_per_endpoint.max(1),
            max_idle: config.pool_max_idle,
            idle_timeout: config.pool_idle_timeout,
            acquire_timeout: config.channel_acquire_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// A channel checked out of the pool.
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it instead frees the slot
/// and discards the channel.
pub struct PooledChannel {
    endpoint: Endpoint,
    channel: AdapterChannel,
    reused: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledChannel {
    #[inline]
    pub fn channel(&self) -> &AdapterChannel {
        &self.channel
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the channel was reused rather than freshly opened.
    #[inline]
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("endpoint", &self.endpoint)
            .field("channel", &self.channel)
            .field("reused", &self.reused)
            .finish()
    }
}

struct IdleChannel {
    channel: AdapterChannel,
    since: Instant,
}

struct Slot {
    permits: Arc<Semaphore>,
    idle: VecDeque<IdleChannel>,
    shared: Option<AdapterChannel>,
}

impl Slot {
    fn new(max_per_endpoint: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_per_endpoint)),
            idle: VecDeque::new(),
            shared: None,
        }
    }
}

/// Owns and recycles adapter channels.
pub struct ConnectionPool {
    settings: PoolSettings,
    slots: Mutex<HashMap<Endpoint, Slot>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Checks out a channel for `endpoint`, opening one through `adapter` if needed.
    pub async fn acquire(
        &self,
        adapter: &dyn ProtocolAdapter,
        endpoint: &Endpoint,
        lease: &Lease,
    ) -> TtsResult<PooledChannel> {
        self.ensure_open()?;

        if endpoint.protocol.supports_multiplexing() {
            return self.acquire_shared(adapter, endpoint, lease).await;
        }

        let permits = self.slot_permits(endpoint);
        let acquire_timeout = self.settings.acquire_timeout;
        let permit = tokio::time::timeout(acquire_timeout, permits.acquire_owned())
            .await
            .map_err(|_| TtsError::timeout("channel acquisition", acquire_timeout))?
            .map_err(|_| TtsError::Transport("connection pool is closed".to_string()))?;

        if let Some(channel) = self.take_idle(endpoint) {
            debug!(endpoint = %endpoint, "Reusing idle channel");
            return Ok(PooledChannel {
                endpoint: endpoint.clone(),
                channel,
                reused: true,
                _permit: Some(permit),
            });
        }

        let channel = self.connect(adapter, endpoint, lease).await?;
        Ok(PooledChannel {
            endpoint: endpoint.clone(),
            channel,
            reused: false,
            _permit: Some(permit),
        })
    }

    /// Returns a channel to the pool. Unhealthy or closed channels are discarded;
    /// multiplexed channels stay warm either way.
    pub fn release(&self, pooled: PooledChannel, healthy: bool) {
        let PooledChannel {
            endpoint,
            channel,
            _permit: permit,
            ..
        } = pooled;

        if endpoint.protocol.supports_multiplexing() {
            return;
        }
        if !healthy || !channel.is_open() || self.closed.load(Ordering::Acquire) {
            debug!(endpoint = %endpoint, healthy, "Discarding channel");
            return;
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&endpoint) {
            slot.idle.push_back(IdleChannel {
                channel,
                since: Instant::now(),
            });
            while slot.idle.len() > self.settings.max_idle {
                slot.idle.pop_front();
            }
        }
        // The permit drops after the channel is parked so the next waiter finds it.
        drop(slots);
        drop(permit);
    }

    /// Drops every pooled channel and fails later acquisitions.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slots = self.slots.lock();
        for slot in slots.values() {
            slot.permits.close();
        }
        let count = slots.len();
        slots.clear();
        info!(endpoints = count, "Connection pool closed");
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idle channels currently parked for `endpoint`.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.slots
            .lock()
            .get(endpoint)
            .map_or(0, |slot| slot.idle.len())
    }

    fn ensure_open(&self) -> TtsResult<()> {
        if self.is_closed() {
            return Err(TtsError::Configuration("client is closed".to_string()));
        }
        Ok(())
    }

    async fn acquire_shared(
        &self,
        adapter: &dyn ProtocolAdapter,
        endpoint: &Endpoint,
        lease: &Lease,
    ) -> TtsResult<PooledChannel> {
        let existing = self
            .slots
            .lock()
            .get(endpoint)
            .and_then(|slot| slot.shared.clone());
        if let Some(channel) = existing {
            return Ok(PooledChannel {
                endpoint: endpoint.clone(),
                channel,
                reused: true,
                _permit: None,
            });
        }

        let opened = self.connect(adapter, endpoint, lease).await?;
        self.ensure_open()?;
        // Another session may have connected concurrently; keep whichever landed first.
        let channel = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(endpoint.clone())
                .or_insert_with(|| Slot::new(self.settings.max_per_endpoint));
            slot.shared.get_or_insert(opened).clone()
        };
        Ok(PooledChannel {
            endpoint: endpoint.clone(),
            channel,
            reused: false,
            _permit: None,
        })
    }

    fn slot_permits(&self, endpoint: &Endpoint) -> Arc<Semaphore> {
        let mut slots = self.slots.lock();
        slots
            .entry(endpoint.clone())
            .or_insert_with(|| Slot::new(self.settings.max_per_endpoint))
            .permits
            .clone()
    }

    fn take_idle(&self, endpoint: &Endpoint) -> Option<AdapterChannel> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(endpoint)?;
        while let Some(idle) = slot.idle.pop_back() {
            if idle.since.elapsed() > self.settings.idle_timeout {
                debug!(endpoint = %endpoint, "Evicting expired idle channel");
                continue;
            }
            if !idle.channel.is_open() {
                debug!(endpoint = %endpoint, "Evicting closed idle channel");
                continue;
            }
            return Some(idle.channel);
        }
        None
    }

    async fn connect(
        &self,
        adapter: &dyn ProtocolAdapter,
        endpoint: &Endpoint,
        lease: &Lease,
    ) -> TtsResult<AdapterChannel> {
        let connect_timeout = self.settings.connect_timeout;
        let channel = tokio::time::timeout(connect_timeout, adapter.open(endpoint, lease))
            .await
            .map_err(|_| TtsError::timeout("connect", connect_timeout))??;
        debug!(endpoint = %endpoint, "Opened channel");
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::{StreamHandle, SynthesisRequest};
    use crate::core::protocol::Protocol;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    struct CountingAdapter {
        protocol: Protocol,
        opens: AtomicUsize,
        open_delay: Duration,
    }

    impl CountingAdapter {
        fn new(protocol: Protocol) -> Self {
            Self {
                protocol,
                opens: AtomicUsize::new(0),
                open_delay: Duration::ZERO,
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProtocolAdapter for CountingAdapter {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn open(&self, _endpoint: &Endpoint, _lease: &Lease) -> TtsResult<AdapterChannel> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            Ok(AdapterChannel::Custom(Arc::new(())))
        }

        async fn send(
            &self,
            _channel: &AdapterChannel,
            _request: SynthesisRequest,
            _lease: Arc<Lease>,
        ) -> TtsResult<StreamHandle> {
            Err(TtsError::Transport("not used".into()))
        }
    }

    fn lease() -> Lease {
        Lease::parse(Bytes::from(Lease::encode_raw(
            SystemTime::now(),
            Duration::from_secs(60),
            &serde_json::json!({}),
        )))
        .unwrap()
    }

    fn pool(settings: PoolSettings) -> ConnectionPool {
        ConnectionPool::new(settings)
    }

    #[tokio::test]
    async fn test_healthy_release_is_reused() {
        let pool = pool(PoolSettings::default());
        let adapter = CountingAdapter::new(Protocol::Http);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");

        let first = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert!(!first.is_reused());
        pool.release(first, true);
        assert_eq!(pool.idle_count(&endpoint), 1);

        let second = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(adapter.opens(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_release_is_discarded() {
        let pool = pool(PoolSettings::default());
        let adapter = CountingAdapter::new(Protocol::WebSocket);
        let endpoint = Endpoint::new(Protocol::WebSocket, "ws://localhost/tts");

        let first = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        pool.release(first, false);
        assert_eq!(pool.idle_count(&endpoint), 0);

        let _second = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert_eq!(adapter.opens(), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_endpoint_saturated() {
        let pool = pool(PoolSettings {
            max_per_endpoint: 1,
            acquire_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let adapter = CountingAdapter::new(Protocol::Http);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");

        let held = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        let err = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap_err();
        assert!(matches!(err, TtsError::Transport(_)));
        assert!(err.is_retryable());

        // Dropping without release frees the slot.
        drop(held);
        assert!(pool.acquire(&adapter, &endpoint, &lease()).await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_timeout_evicts() {
        let pool = pool(PoolSettings {
            idle_timeout: Duration::from_millis(5),
            ..Default::default()
        });
        let adapter = CountingAdapter::new(Protocol::Http);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");

        let first = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        pool.release(first, true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert!(!second.is_reused());
        assert_eq!(adapter.opens(), 2);
    }

    #[tokio::test]
    async fn test_idle_list_is_capped() {
        let pool = pool(PoolSettings {
            max_idle: 1,
            ..Default::default()
        });
        let adapter = CountingAdapter::new(Protocol::Http);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");

        let a = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        let b = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        pool.release(a, true);
        pool.release(b, true);
        assert_eq!(pool.idle_count(&endpoint), 1);
    }

    #[tokio::test]
    async fn test_multiplexed_channel_is_shared() {
        let pool = pool(PoolSettings {
            max_per_endpoint: 1,
            ..Default::default()
        });
        let adapter = CountingAdapter::new(Protocol::Grpc);
        let endpoint = Endpoint::new(Protocol::Grpc, "localhost:50051");

        let a = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        let b = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert!(b.is_reused());
        pool.release(a, false);
        let c = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap();
        assert!(c.is_reused());
        assert_eq!(adapter.opens(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let pool = pool(PoolSettings {
            connect_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let mut adapter = CountingAdapter::new(Protocol::Http);
        adapter.open_delay = Duration::from_millis(200);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");

        let err = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap_err();
        assert!(matches!(err, TtsError::Transport(m) if m.contains("connect")));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = pool(PoolSettings::default());
        let adapter = CountingAdapter::new(Protocol::Http);
        let endpoint = Endpoint::new(Protocol::Http, "http://localhost/tts");
        pool.close();
        let err = pool.acquire(&adapter, &endpoint, &lease()).await.unwrap_err();
        assert!(matches!(err, TtsError::Configuration(_)));
    }
}
