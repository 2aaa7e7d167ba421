//! Per-request telemetry.
//!
//! Every synthesis request leaves one [`RequestMetrics`] record in a bounded ring buffer;
//! the oldest record is dropped once the buffer is full.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;

use super::options::AudioFormat;
use super::protocol::Protocol;
use crate::errors::TtsError;

/// Final status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Ok,
    Error,
    Canceled,
}

/// What happened during one synthesis request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub operation: &'static str,
    pub request_id: String,
    pub engine: String,
    pub protocol: Protocol,
    /// Endpoints used, one per attempt that got as far as resolving one.
    pub endpoints: Vec<String>,
    pub status: RequestStatus,
    pub started_at: SystemTime,
    pub duration: Duration,
    /// Time until the first chunk carrying samples, which for container formats is
    /// the chunk after the header.
    pub time_to_first_audio: Option<Duration>,
    pub attempts: u32,
    pub chunks: u64,
    pub bytes: u64,
    /// Error class and message of the failure that ended the request.
    pub error: Option<String>,
    /// Reasons for each retried attempt.
    pub retry_reasons: Vec<String>,
    /// Why the request moved to the fallback address, if it did.
    pub fallback_reason: Option<String>,
}

/// In-progress record for one request; finished into a [`RequestMetrics`].
#[derive(Debug)]
pub struct MetricsRecorder {
    record: RequestMetrics,
    started: Instant,
    first_audio_chunk: u64,
}

impl MetricsRecorder {
    pub fn start(
        operation: &'static str,
        request_id: impl Into<String>,
        engine: impl Into<String>,
        protocol: Protocol,
        format: AudioFormat,
    ) -> Self {
        Self {
            record: RequestMetrics {
                operation,
                request_id: request_id.into(),
                engine: engine.into(),
                protocol,
                endpoints: Vec::new(),
                status: RequestStatus::Ok,
                started_at: SystemTime::now(),
                duration: Duration::ZERO,
                time_to_first_audio: None,
                attempts: 0,
                chunks: 0,
                bytes: 0,
                error: None,
                retry_reasons: Vec::new(),
                fallback_reason: None,
            },
            started: Instant::now(),
            first_audio_chunk: format.first_audio_chunk(),
        }
    }

    pub fn attempt(&mut self) {
        self.record.attempts += 1;
    }

    pub fn endpoint(&mut self, endpoint: String) {
        if !self.record.endpoints.contains(&endpoint) {
            self.record.endpoints.push(endpoint);
        }
    }

    pub fn retry(&mut self, reason: &TtsError) {
        self.record.retry_reasons.push(reason.to_string());
    }

    pub fn fallback(&mut self, reason: &TtsError) {
        self.record.fallback_reason = Some(reason.to_string());
    }

    pub fn chunk(&mut self, bytes: usize) {
        if self.record.chunks == self.first_audio_chunk {
            self.record.time_to_first_audio = Some(self.started.elapsed());
        }
        self.record.chunks += 1;
        self.record.bytes += bytes as u64;
    }

    pub fn finish_ok(self) -> RequestMetrics {
        self.finish(RequestStatus::Ok, None)
    }

    pub fn finish_canceled(self) -> RequestMetrics {
        self.finish(RequestStatus::Canceled, None)
    }

    pub fn finish_error(self, error: &TtsError) -> RequestMetrics {
        self.finish(
            RequestStatus::Error,
            Some(format!("{}: {error}", error.kind())),
        )
    }

    fn finish(mut self, status: RequestStatus, error: Option<String>) -> RequestMetrics {
        self.record.status = status;
        self.record.error = error;
        self.record.duration = self.started.elapsed();
        self.record
    }
}

/// Bounded history of request records.
#[derive(Debug)]
pub struct Telemetry {
    capacity: usize,
    records: Mutex<VecDeque<RequestMetrics>>,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, metrics: RequestMetrics) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(metrics);
    }

    /// Records oldest first.
    pub fn snapshot(&self) -> Vec<RequestMetrics> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> RequestMetrics {
        MetricsRecorder::start("tts-request", id, "Play3.0-mini", Protocol::Http, AudioFormat::Raw)
            .finish_ok()
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let telemetry = Telemetry::new(2);
        telemetry.record(record("a"));
        telemetry.record(record("b"));
        telemetry.record(record("c"));
        let ids: Vec<_> = telemetry
            .snapshot()
            .into_iter()
            .map(|m| m.request_id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let telemetry = Telemetry::new(0);
        telemetry.record(record("a"));
        assert!(telemetry.is_empty());
    }

    #[test]
    fn test_recorder_counts() {
        let mut recorder = MetricsRecorder::start(
            "tts-request",
            "r",
            "PlayDialog",
            Protocol::WebSocket,
            AudioFormat::Raw,
        );
        recorder.attempt();
        recorder.endpoint("wss://a".into());
        recorder.endpoint("wss://a".into());
        recorder.chunk(10);
        recorder.chunk(5);
        let err = TtsError::Transport("reset".into());
        recorder.retry(&err);
        let m = recorder.finish_error(&err);
        assert_eq!(m.status, RequestStatus::Error);
        assert_eq!(m.chunks, 2);
        assert_eq!(m.bytes, 15);
        assert_eq!(m.endpoints.len(), 1);
        assert!(m.time_to_first_audio.is_some());
        assert_eq!(m.error.as_deref(), Some("transport: Transport error: reset"));
    }

    fn recorder(protocol: Protocol, format: AudioFormat) -> MetricsRecorder {
        MetricsRecorder::start("tts-request", "r", "Play3.0-mini", protocol, format)
    }

    #[test]
    fn test_first_audio_skips_container_header() {
        let mut wav = recorder(Protocol::Grpc, AudioFormat::Wav);
        wav.chunk(44);
        assert!(wav.record.time_to_first_audio.is_none());
        wav.chunk(1024);
        assert!(wav.record.time_to_first_audio.is_some());

        let mut raw = recorder(Protocol::Grpc, AudioFormat::Raw);
        raw.chunk(1024);
        assert!(raw.record.time_to_first_audio.is_some());

        let mut header_only = recorder(Protocol::Http, AudioFormat::Mp3);
        header_only.chunk(10);
        assert!(header_only.finish_ok().time_to_first_audio.is_none());
    }

    #[test]
    fn test_fallback_reason_is_recorded() {
        let mut grpc = recorder(Protocol::Grpc, AudioFormat::Raw);
        grpc.fallback(&TtsError::Transport("Unavailable: overloaded".into()));
        let m = grpc.finish_ok();
        assert_eq!(
            m.fallback_reason.as_deref(),
            Some("Transport error: Unavailable: overloaded")
        );
    }
}
