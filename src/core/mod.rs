pub mod adapter;
pub mod blocking;
pub mod chunk;
pub mod client;
pub mod engine;
pub mod lease;
pub mod messages;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod reassembler;
pub mod session;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use adapter::{
    AdapterChannel, AdapterSet, AdapterSettings, ChunkSender, Endpoint, GrpcAdapter, HttpAdapter,
    ProtocolAdapter, StreamHandle, SynthesisRequest, WebSocketAdapter,
};
pub use blocking::{BlockingAudioStream, BlockingClient};
pub use chunk::{AudioChunk, ChunkStatus};
pub use client::{AudioStream, CancelHandle, Client, ClientBuilder, TextSink};
pub use engine::{Engine, EngineSelection};
pub use lease::{HttpLeaseFetcher, Lease, LeaseFetcher, LeaseManager, LeaseMetadata, LeaseSettings};
pub use options::{AudioFormat, OptionKey, RequestOptions};
pub use pool::{ConnectionPool, PoolSettings, PooledChannel};
pub use protocol::Protocol;
pub use reassembler::{ChunkReassembler, Outcome, Reassembled};
pub use session::SessionState;
pub use telemetry::{RequestMetrics, RequestStatus};
