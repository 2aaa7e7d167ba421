use bytes::Bytes;

/// Status carried by one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    InProgress,
    Complete,
    Canceled,
    Error {
        code: Option<i32>,
        messages: Vec<String>,
    },
}

impl ChunkStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One ordered unit of audio as produced by a protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Monotonic per session, starting at 0.
    pub sequence: u64,
    pub payload: Bytes,
    pub status: ChunkStatus,
}

impl AudioChunk {
    pub fn audio(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
            status: ChunkStatus::InProgress,
        }
    }

    pub fn complete(sequence: u64) -> Self {
        Self {
            sequence,
            payload: Bytes::new(),
            status: ChunkStatus::Complete,
        }
    }

    pub fn canceled(sequence: u64) -> Self {
        Self {
            sequence,
            payload: Bytes::new(),
            status: ChunkStatus::Canceled,
        }
    }

    pub fn error(sequence: u64, code: Option<i32>, messages: Vec<String>) -> Self {
        Self {
            sequence,
            payload: Bytes::new(),
            status: ChunkStatus::Error { code, messages },
        }
    }
}
