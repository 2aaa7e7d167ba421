use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{TtsError, TtsResult};

/// Lease timestamps count seconds from this Unix time.
pub const LEASE_EPOCH_SECS: u64 = 1_519_257_480;

const HEADER_LEN: usize = 72;
const CREATED_AT: std::ops::Range<usize> = 64..68;
const DURATION_AT: std::ops::Range<usize> = 68..72;

/// Endpoint hints embedded in a lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    /// gRPC `host:port` for inference.
    #[serde(default)]
    pub inference_address: Option<String>,
    #[serde(default)]
    pub http_address: Option<String>,
    #[serde(default)]
    pub websocket_address: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A decoded lease. Shared read-only as `Arc<Lease>`.
#[derive(Clone)]
pub struct Lease {
    data: Bytes,
    created: SystemTime,
    validity: Duration,
    metadata: LeaseMetadata,
}

impl Lease {
    /// Decodes lease bytes: a 64 byte signature, big-endian creation time and validity
    /// (seconds), then a JSON metadata object.
    pub fn parse(data: Bytes) -> TtsResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(TtsError::Authorization(format!(
                "lease too short: {} bytes",
                data.len()
            )));
        }
        let created = read_u32(&data[CREATED_AT]);
        let validity = read_u32(&data[DURATION_AT]);
        let metadata: LeaseMetadata = if data.len() == HEADER_LEN {
            LeaseMetadata::default()
        } else {
            serde_json::from_slice(&data[HEADER_LEN..]).map_err(|e| {
                TtsError::Authorization(format!("lease metadata is not valid JSON: {e}"))
            })?
        };

        Ok(Self {
            created: UNIX_EPOCH + Duration::from_secs(LEASE_EPOCH_SECS + created as u64),
            validity: Duration::from_secs(validity as u64),
            metadata,
            data,
        })
    }

    /// Builds lease bytes in the service layout. Used by local test servers.
    pub fn encode_raw(created: SystemTime, validity: Duration, metadata: &serde_json::Value) -> Vec<u8> {
        let created = created
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(LEASE_EPOCH_SECS))
            .unwrap_or(0) as u32;
        let mut out = vec![0u8; 64];
        out.extend_from_slice(&created.to_be_bytes());
        out.extend_from_slice(&(validity.as_secs() as u32).to_be_bytes());
        out.extend_from_slice(metadata.to_string().as_bytes());
        out
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Lease bytes as standard base64, as sent in HTTP and WebSocket headers.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    #[inline]
    pub fn metadata(&self) -> &LeaseMetadata {
        &self.metadata
    }

    #[inline]
    pub fn created(&self) -> SystemTime {
        self.created
    }

    #[inline]
    pub fn validity(&self) -> Duration {
        self.validity
    }

    #[inline]
    pub fn expires_at(&self) -> SystemTime {
        self.created + self.validity
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.expires_at()
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.remaining_at(now).is_zero()
    }

    /// True once less than `fraction` of the validity window remains.
    pub fn needs_refresh_at(&self, fraction: f64, now: SystemTime) -> bool {
        let remaining = self.remaining_at(now);
        remaining.is_zero() || remaining < self.validity.mul_f64(fraction)
    }

    /// Delay until the refresh window opens (zero if already open).
    pub fn refresh_due_in(&self, fraction: f64, now: SystemTime) -> Duration {
        self.remaining_at(now)
            .saturating_sub(self.validity.mul_f64(fraction))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("len", &self.data.len())
            .field("created", &self.created)
            .field("validity", &self.validity)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}
