//! # tracewire core
//!
//! The data plane of the tracewire telemetry pipeline: fixed-capacity event
//! chunks, the variable-length token codec, delta-compressed timestamps, and
//! the chunk pool/queue that move buffered event data from producer threads
//! to the single session consumer.
//!
//! This crate provides:
//! - **Chunks**: 64 KiB buffers holding packed event tokens, the unit of
//!   allocation, queuing, and network transfer
//! - **Token codec**: the four token kinds (provider, data, timestamp,
//!   time-delta) plus whole-stream and incremental decoders
//! - **Timestamp encoding**: per-event decision between a 4-bit inline delta,
//!   a multi-byte delta token, and a full timestamp token
//! - **Chunk pool**: a recycled free list bounded by a soft memory target and
//!   trimmed in the background
//! - **Chunk queue**: the FIFO hand-off from producers to the consumer
//!
//! ## Design Principles
//!
//! 1. **Single-owner chunks** - a chunk is always owned by exactly one of
//!    the producer's stream, the pool, the queue, or the session cursor;
//!    ownership transfer is a move, so a released chunk cannot be touched
//! 2. **No blocking on the hot path** - locks are short-held and sized for
//!    O(1) push/pop; maintenance uses `try_lock` and skips under contention
//! 3. **Loss over latency** - when memory is exhausted, events are dropped
//!    and counted, producers are never stalled

pub mod chunk;
pub mod pool;
pub mod queue;
pub mod time;
pub mod token;
pub mod writer;

pub use chunk::{EventChunk, OutOfSpace, CHUNK_DATA_CAPACITY, CHUNK_TOTAL_SIZE};
pub use pool::{ChunkPool, PoolConfig, TRIM_BATCH};
pub use queue::ChunkQueue;
pub use time::{DeltaEncoder, ManualClock, MonotonicClock, TimeSource, TimestampEncoding};
pub use token::{DecodeError, StreamDecoder, StreamItem, Token, TokenKind};
pub use writer::ChunkWriter;

/// Result type for tracewire-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tracewire-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A write did not fit in the remaining chunk space.
    #[error(transparent)]
    OutOfSpace(#[from] OutOfSpace),

    /// A token stream could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}
