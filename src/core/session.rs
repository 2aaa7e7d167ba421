//! One synthesis exchange from lease to terminal chunk.
//!
//! [`drive`] turns a [`SessionPlan`] into a lazy stream of audio payloads. It acquires a
//! lease, checks a channel out of the pool, starts the adapter and feeds every chunk
//! through a [`ChunkReassembler`]. Transient failures restart the whole exchange as long
//! as no audio has reached the caller yet. A gRPC session whose retries against an
//! overridden address are spent gets one last attempt on the lease's inference address
//! when fallback is enabled.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::adapter::{AdapterSet, Endpoint, SynthesisRequest};
use super::engine::Engine;
use super::lease::{Lease, LeaseManager};
use super::options::RequestOptions;
use super::pool::{ConnectionPool, PooledChannel};
use super::protocol::Protocol;
use super::reassembler::{ChunkReassembler, Outcome, Reassembled};
use super::telemetry::{MetricsRecorder, Telemetry};
use crate::config::ClientConfig;
use crate::errors::{TtsError, TtsResult};

/// Ordered audio payloads for one request.
pub type ByteStream = Pin<Box<dyn Stream<Item = TtsResult<Bytes>> + Send>>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Validating,
    Leasing,
    Connecting,
    Streaming,
    Complete,
    Canceled,
    Failed,
}

impl SessionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Leasing => "leasing",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of a session's state; the driver writes, streams read.
#[derive(Debug, Clone)]
pub struct StateCell {
    state: Arc<Mutex<SessionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::Validating)),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn enter(&self, request_id: &str, next: SessionState) {
        let mut state = self.state.lock();
        if state.is_terminal() || *state == next {
            return;
        }
        debug!(request_id, from = %*state, to = %next, "Session state change");
        *state = next;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a client shares across its sessions.
pub(crate) struct ClientCore {
    pub config: ClientConfig,
    pub leases: LeaseManager,
    pub pool: ConnectionPool,
    pub adapters: AdapterSet,
    pub telemetry: Telemetry,
    /// Cancelled by `close`; every session token is a child of it.
    pub shutdown: CancellationToken,
}

/// A validated request, ready to be driven.
pub(crate) struct SessionPlan {
    pub operation: &'static str,
    pub request_id: String,
    pub engine: Engine,
    pub protocol: Protocol,
    pub text: Vec<String>,
    pub options: Arc<RequestOptions>,
    /// Follow-up fragments for a duplex session. Such sessions get a single attempt
    /// because fragments already consumed cannot be replayed.
    pub follow_up: Option<mpsc::Receiver<String>>,
}

/// Drives `plan` to completion, yielding audio payloads in order.
///
/// The stream ends without an item on cancellation, ends after the last payload on
/// completion, or yields exactly one error and ends.
pub(crate) fn drive(
    core: Arc<ClientCore>,
    plan: SessionPlan,
    cancel: CancellationToken,
    state: StateCell,
) -> ByteStream {
    Box::pin(stream! {
        let SessionPlan {
            operation,
            request_id,
            engine,
            protocol,
            text,
            options,
            mut follow_up,
        } = plan;

        let retry = core.config.retry.clone();
        let duplex = follow_up.is_some();
        let max_attempts = if duplex { 1 } else { retry.max_attempts.max(1) };
        let mut metrics = MetricsRecorder::start(
            operation,
            &request_id,
            engine.as_str(),
            protocol,
            options.format,
        );
        let mut attempt = 0u32;
        let mut delivered = false;
        let mut fallback: Option<Endpoint> = None;

        loop {
            attempt += 1;
            metrics.attempt();
            let mut used_lease: Option<Arc<Lease>> = None;
            let mut checked_out: Option<PooledChannel> = None;

            let failure: TtsError = 'attempt: {
                state.enter(&request_id, SessionState::Leasing);
                let leased = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = core.leases.acquire() => Some(r),
                };
                let lease = match leased {
                    None => {
                        state.enter(&request_id, SessionState::Canceled);
                        core.telemetry.record(metrics.finish_canceled());
                        return;
                    }
                    Some(Ok(lease)) => lease,
                    Some(Err(e)) => break 'attempt e,
                };
                used_lease = Some(lease.clone());

                state.enter(&request_id, SessionState::Connecting);
                let resolved = match &fallback {
                    Some(endpoint) => Ok(endpoint.clone()),
                    None => Endpoint::resolve(protocol, &core.config, &lease),
                };
                let endpoint = match resolved {
                    Ok(endpoint) => endpoint,
                    Err(e) => break 'attempt e,
                };
                metrics.endpoint(endpoint.to_string());
                let adapter = match core.adapters.get(protocol) {
                    Ok(adapter) => adapter,
                    Err(e) => break 'attempt e,
                };

                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = core.pool.acquire(adapter.as_ref(), &endpoint, &lease) => Some(r),
                };
                let pooled = match acquired {
                    None => {
                        state.enter(&request_id, SessionState::Canceled);
                        core.telemetry.record(metrics.finish_canceled());
                        return;
                    }
                    Some(Ok(pooled)) => pooled,
                    Some(Err(e)) => break 'attempt e,
                };

                let request = SynthesisRequest {
                    request_id: request_id.clone(),
                    engine,
                    text: text.clone(),
                    options: options.clone(),
                    follow_up: follow_up.take(),
                    cancel: cancel.clone(),
                };
                let sent = adapter.send(pooled.channel(), request, lease.clone()).await;
                checked_out = Some(pooled);
                let mut handle = match sent {
                    Ok(handle) => handle,
                    Err(e) => break 'attempt e,
                };

                state.enter(&request_id, SessionState::Streaming);
                let mut reassembler = ChunkReassembler::new();
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = handle.receive() => item,
                    };
                    let chunk = match item {
                        None if cancel.is_cancelled() => {
                            handle.cancel();
                            if let Some(pooled) = checked_out.take() {
                                core.pool.release(pooled, true);
                            }
                            debug!(request_id = %request_id, "Session canceled by caller");
                            state.enter(&request_id, SessionState::Canceled);
                            core.telemetry.record(metrics.finish_canceled());
                            return;
                        }
                        None => {
                            break 'attempt TtsError::Transport(
                                "stream ended before a terminal status".to_string(),
                            );
                        }
                        Some(Err(e)) => break 'attempt e,
                        Some(Ok(chunk)) => chunk,
                    };

                    match reassembler.accept(chunk) {
                        Ok(Reassembled::Audio(payload)) => {
                            delivered = true;
                            metrics.chunk(payload.len());
                            yield Ok(payload);
                        }
                        Ok(Reassembled::Skip) => {}
                        Ok(Reassembled::Finished { trailing, outcome }) => {
                            // The sequence is closed; anything already queued behind the
                            // terminal chunk is a fault on this channel.
                            let mut healthy = true;
                            if let Some(Ok(late)) = handle.try_receive() {
                                if let Err(e) = reassembler.accept(late) {
                                    warn!(request_id = %request_id, error = %e, "Discarding late chunk");
                                    healthy = false;
                                }
                            }
                            if let Some(payload) = trailing {
                                metrics.chunk(payload.len());
                                yield Ok(payload);
                            }
                            if let Some(pooled) = checked_out.take() {
                                core.pool.release(pooled, healthy);
                            }
                            match outcome {
                                Outcome::Complete => {
                                    debug!(
                                        request_id = %request_id,
                                        attempt,
                                        bytes = reassembler.delivered_bytes(),
                                        "Session complete"
                                    );
                                    state.enter(&request_id, SessionState::Complete);
                                    core.telemetry.record(metrics.finish_ok());
                                }
                                Outcome::Canceled => {
                                    info!(request_id = %request_id, "Session canceled by server");
                                    state.enter(&request_id, SessionState::Canceled);
                                    core.telemetry.record(metrics.finish_canceled());
                                }
                            }
                            return;
                        }
                        Err(e) => break 'attempt e,
                    }
                }
            };

            if let Some(pooled) = checked_out.take() {
                core.pool.release(pooled, !failure.marks_channel_unhealthy());
            }
            if let (TtsError::Authorization(_), Some(lease)) = (&failure, &used_lease) {
                core.leases.invalidate(lease);
            }

            if failure.is_retryable() && !delivered && attempt < max_attempts && !cancel.is_cancelled() {
                let delay = retry.calculate_delay(attempt);
                debug!(
                    request_id = %request_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Retrying synthesis"
                );
                metrics.retry(&failure);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        state.enter(&request_id, SessionState::Canceled);
                        core.telemetry.record(metrics.finish_canceled());
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            if cancel.is_cancelled() {
                state.enter(&request_id, SessionState::Canceled);
                core.telemetry.record(metrics.finish_canceled());
                return;
            }

            let eligible = protocol == Protocol::Grpc
                && fallback.is_none()
                && !duplex
                && !delivered
                && failure.is_retryable();
            let fallback_to = used_lease
                .as_deref()
                .filter(|_| eligible)
                .and_then(|lease| Endpoint::grpc_fallback(&core.config, lease));
            if let Some(endpoint) = fallback_to {
                info!(
                    request_id = %request_id,
                    fallback = %endpoint,
                    error = %failure,
                    "Falling back to the lease inference address"
                );
                metrics.fallback(&failure);
                fallback = Some(endpoint);
                continue;
            }

            warn!(
                request_id = %request_id,
                attempt,
                kind = failure.kind(),
                error = %failure,
                "Synthesis failed"
            );
            state.enter(&request_id, SessionState::Failed);
            core.telemetry.record(metrics.finish_error(&failure));
            yield Err(failure);
            return;
        }
    })
}
