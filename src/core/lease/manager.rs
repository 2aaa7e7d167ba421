use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetcher::LeaseFetcher;
use super::token::Lease;
use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};

/// Background refresh waits this long when no lease has been fetched yet.
const NO_LEASE_REFRESH_DELAY: Duration = Duration::from_secs(285);

/// Background refresh waits this long after a failed refresh.
const FAILED_REFRESH_DELAY: Duration = Duration::from_secs(5);

type SharedRefresh = Shared<BoxFuture<'static, TtsResult<Arc<Lease>>>>;

/// Lease caching and refresh policy.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseSettings {
    /// Refresh once less than this fraction of the validity window remains.
    pub refresh_fraction: f64,
    /// Fetch attempts per refresh; only transport failures are retried.
    pub max_attempts: u32,
    /// Bound on a whole acquisition, including waiting on another caller's refresh.
    pub timeout: Duration,
    /// Pause between fetch attempts.
    pub retry_backoff: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            refresh_fraction: 0.1,
            max_attempts: 2,
            timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl LeaseSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            refresh_fraction: config.lease_refresh_fraction,
            max_attempts: config.lease_max_attempts.max(1),
            timeout: config.lease_timeout,
            retry_backoff: Duration::from_millis(config.retry.initial_backoff_ms),
        }
    }
}

/// Owns the current lease and serializes refreshes.
///
/// Cloning is cheap; clones share the same cache. Concurrent [`acquire`](Self::acquire)
/// calls that find the cache stale all await one shared refresh and receive the same
/// result, success or failure.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn LeaseFetcher>,
    settings: LeaseSettings,
    current: RwLock<Option<Arc<Lease>>>,
    inflight: Mutex<Option<SharedRefresh>>,
}

impl LeaseManager {
    pub fn new(fetcher: Arc<dyn LeaseFetcher>, settings: LeaseSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                settings,
                current: RwLock::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// The cached lease, whether or not it is due for refresh.
    pub fn current(&self) -> Option<Arc<Lease>> {
        self.inner.current.read().clone()
    }

    /// Returns a usable lease, refreshing it first if it is inside the safety window.
    pub async fn acquire(&self) -> TtsResult<Arc<Lease>> {
        if let Some(lease) = self.inner.fresh_cached() {
            return Ok(lease);
        }
        self.await_refresh(false).await
    }

    /// Fetches a new lease even if the cached one is still fresh. Joins an in-flight
    /// refresh instead of starting a second one.
    pub async fn refresh(&self) -> TtsResult<Arc<Lease>> {
        self.await_refresh(true).await
    }

    /// Drops `lease` from the cache if it is still the current one.
    pub fn invalidate(&self, lease: &Arc<Lease>) {
        let mut current = self.inner.current.write();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, lease)) {
            *current = None;
            warn!("Lease invalidated; next acquisition will fetch a new one");
        } else {
            debug!("Ignoring invalidation of a lease that is no longer current");
        }
    }

    /// Keeps the lease fresh until `cancel` fires.
    pub fn spawn_auto_refresh(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let fraction = manager.inner.settings.refresh_fraction;
            let mut delay = match manager.current() {
                Some(lease) => lease.refresh_due_in(fraction, SystemTime::now()),
                None => NO_LEASE_REFRESH_DELAY,
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = match manager.acquire().await {
                    Ok(lease) => lease
                        .refresh_due_in(fraction, SystemTime::now())
                        .max(Duration::from_secs(1)),
                    Err(e) => {
                        warn!(error = %e, "Background lease refresh failed");
                        FAILED_REFRESH_DELAY
                    }
                };
                debug!(next_in_ms = delay.as_millis() as u64, "Scheduled lease refresh");
            }
            debug!("Background lease refresh stopped");
        })
    }

    async fn await_refresh(&self, force: bool) -> TtsResult<Arc<Lease>> {
        let refresh = self.join_or_start(force);
        let timeout = self.inner.settings.timeout;
        match tokio::time::timeout(timeout, refresh).await {
            Ok(result) => result,
            Err(_) => Err(TtsError::timeout("lease acquisition", timeout)),
        }
    }

    fn join_or_start(&self, force: bool) -> SharedRefresh {
        let mut inflight = self.inner.inflight.lock();
        if let Some(refresh) = inflight.as_ref() {
            return refresh.clone();
        }
        // A refresh may have finished between the caller's cache check and this lock.
        if !force && let Some(lease) = self.inner.fresh_cached() {
            return future::ready(Ok(lease)).boxed().shared();
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run_refresh());
        let refresh = async move {
            task.await.unwrap_or_else(|e| {
                Err(TtsError::Authorization(format!("lease refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared();
        *inflight = Some(refresh.clone());
        refresh
    }
}

impl Inner {
    fn fresh_cached(&self) -> Option<Arc<Lease>> {
        self.current
            .read()
            .as_ref()
            .filter(|l| !l.needs_refresh_at(self.settings.refresh_fraction, SystemTime::now()))
            .cloned()
    }

    async fn run_refresh(self: Arc<Self>) -> TtsResult<Arc<Lease>> {
        let result = self.fetch_with_retry().await;
        if let Ok(lease) = &result {
            *self.current.write() = Some(Arc::clone(lease));
        }
        *self.inflight.lock() = None;
        result
    }

    async fn fetch_with_retry(&self) -> TtsResult<Arc<Lease>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetcher.fetch().await.and_then(Lease::parse) {
                Ok(lease) => {
                    if lease.is_expired_at(SystemTime::now()) {
                        error!("Received an already expired lease");
                        return Err(TtsError::Authorization(
                            "received an expired lease; is the system clock correct?".to_string(),
                        ));
                    }
                    info!(
                        validity_secs = lease.validity().as_secs(),
                        attempt, "Lease refreshed"
                    );
                    return Ok(Arc::new(lease));
                }
                Err(TtsError::Transport(msg)) if attempt < self.settings.max_attempts => {
                    warn!(attempt, error = %msg, "Lease fetch failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Lease refresh failed");
                    return Err(match e {
                        TtsError::Authorization(_) => e,
                        other => TtsError::Authorization(format!(
                            "lease refresh failed after {attempt} attempt(s): {other}"
                        )),
                    });
                }
            }
        }
    }
}
