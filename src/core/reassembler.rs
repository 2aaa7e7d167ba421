//! Ordering and terminal-status enforcement for one session's chunk sequence.

use bytes::Bytes;

use super::chunk::{AudioChunk, ChunkStatus};
use crate::errors::{TtsError, TtsResult};

/// How a session's chunk sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Canceled,
}

/// What the caller should see for one accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    /// Audio to deliver. Empty payloads are never returned.
    Audio(Bytes),
    /// The sequence ended; `trailing` is audio carried by the terminal chunk.
    Finished {
        trailing: Option<Bytes>,
        outcome: Outcome,
    },
    /// Nothing to deliver (empty in-progress chunk).
    Skip,
}

/// Enforces contiguous, increasing sequence numbers starting at 0 and a single
/// terminal chunk.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    next_sequence: u64,
    terminated: bool,
    delivered_bytes: usize,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next chunk must carry.
    #[inline]
    pub fn expected(&self) -> u64 {
        self.next_sequence
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Payload bytes handed out so far.
    #[inline]
    pub fn delivered_bytes(&self) -> usize {
        self.delivered_bytes
    }

    pub fn accept(&mut self, chunk: AudioChunk) -> TtsResult<Reassembled> {
        if self.terminated {
            return Err(TtsError::ProtocolIntegrity(format!(
                "chunk {} received after the terminal chunk",
                chunk.sequence
            )));
        }
        if chunk.sequence != self.next_sequence {
            let kind = if chunk.sequence < self.next_sequence {
                "duplicate or out-of-order"
            } else {
                "missing"
            };
            return Err(TtsError::ProtocolIntegrity(format!(
                "{kind} chunk: expected sequence {}, got {}",
                self.next_sequence, chunk.sequence
            )));
        }
        self.next_sequence += 1;

        let payload = (!chunk.payload.is_empty()).then_some(chunk.payload);
        if let Some(p) = &payload {
            self.delivered_bytes += p.len();
        }

        match chunk.status {
            ChunkStatus::InProgress => Ok(payload.map_or(Reassembled::Skip, Reassembled::Audio)),
            ChunkStatus::Complete => {
                self.terminated = true;
                Ok(Reassembled::Finished {
                    trailing: payload,
                    outcome: Outcome::Complete,
                })
            }
            ChunkStatus::Canceled => {
                self.terminated = true;
                Ok(Reassembled::Finished {
                    trailing: None,
                    outcome: Outcome::Canceled,
                })
            }
            ChunkStatus::Error { code, messages } => {
                self.terminated = true;
                let messages = if messages.is_empty() {
                    vec!["synthesis failed without a message".to_string()]
                } else {
                    messages
                };
                Err(TtsError::Server { code, messages })
            }
        }
    }
}
