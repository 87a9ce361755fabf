//! Multi-chunk token writer.
//!
//! [`ChunkWriter`] borrows an ordered run of chunks and writes token bytes
//! across them, advancing to the next chunk whenever the current one fills.
//! [`OutOfSpace`](crate::chunk::OutOfSpace) is returned only when the final
//! chunk in the run is exhausted.
//!
//! Token-level methods are atomic at the call level: on failure the caller
//! must treat the whole token write as failed and stop using the run (a
//! truncated token may remain in the last chunk). Callers that size the run
//! for the worst case up front never observe a failure.

use smallvec::SmallVec;

use crate::chunk::{EventChunk, OutOfSpace};
use crate::token::{pack_header, TokenKind, MAX_SMALL_DELTA, MAX_TIME_DELTA_BYTES, MAX_TOKEN_SIZE};

/// Scratch buffer sized for the largest token.
type TokenBuf = SmallVec<[u8; MAX_TOKEN_SIZE]>;

/// Writes event tokens across an ordered run of chunks.
#[derive(Debug)]
pub struct ChunkWriter<'a> {
    chunks: &'a mut [Box<EventChunk>],
    current: usize,
}

impl<'a> ChunkWriter<'a> {
    /// Creates a writer over `chunks`, starting at the first chunk with
    /// space remaining.
    pub fn new(chunks: &'a mut [Box<EventChunk>]) -> Self {
        Self { chunks, current: 0 }
    }

    /// Appends raw bytes, striding over chunk boundaries as needed.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] when the run is exhausted; some prefix of
    /// `bytes` may already have been written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), OutOfSpace> {
        let mut written = 0;
        while written < bytes.len() {
            while self.chunks.get(self.current).is_some_and(|c| c.is_full()) {
                self.current += 1;
            }
            let Some(chunk) = self.chunks.get_mut(self.current) else {
                return Err(OutOfSpace);
            };
            let take = chunk.remaining().min(bytes.len() - written);
            chunk.write(&bytes[written..written + take])?;
            written += take;
        }
        Ok(())
    }

    /// Writes a provider token marking the start of a new stream.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] if the token does not fit in the run.
    pub fn provider_token(
        &mut self,
        provider_id: u32,
        frequency: u64,
        timestamp: u64,
    ) -> Result<(), OutOfSpace> {
        let mut buf = TokenBuf::new();
        buf.push(pack_header(TokenKind::Provider, 0));
        buf.extend_from_slice(&provider_id.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&frequency.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        self.write(&buf)
    }

    /// Writes a data token. The caller writes the `payload_size` payload
    /// bytes (and any event header bytes they cover) immediately after.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] if the token does not fit in the run.
    pub fn data_token(
        &mut self,
        small_delta: u8,
        event_id: u32,
        event_index: u32,
        payload_size: u64,
    ) -> Result<(), OutOfSpace> {
        debug_assert!(u64::from(small_delta) <= MAX_SMALL_DELTA);
        let mut buf = TokenBuf::new();
        buf.push(pack_header(TokenKind::Data, small_delta));
        buf.extend_from_slice(&event_id.to_le_bytes());
        buf.extend_from_slice(&event_index.to_le_bytes());
        buf.extend_from_slice(&payload_size.to_le_bytes());
        self.write(&buf)
    }

    /// Writes a full timestamp token, rebasing the stream clock.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] if the token does not fit in the run.
    pub fn timestamp_token(&mut self, frequency: u64, timestamp: u64) -> Result<(), OutOfSpace> {
        let mut buf = TokenBuf::new();
        buf.push(pack_header(TokenKind::Timestamp, 0));
        buf.extend_from_slice(&frequency.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        self.write(&buf)
    }

    /// Writes a time-delta token encoding `delta` in `num_bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] if the token does not fit in the run.
    pub fn time_delta_token(&mut self, delta: u64, num_bytes: u8) -> Result<(), OutOfSpace> {
        debug_assert!(num_bytes >= 1 && num_bytes as usize <= MAX_TIME_DELTA_BYTES);
        debug_assert!(
            num_bytes as usize == MAX_TIME_DELTA_BYTES
                || delta < (1u64 << (u32::from(num_bytes) * 8))
        );
        let mut buf = TokenBuf::new();
        buf.push(pack_header(TokenKind::TimeDelta, 0));
        buf.push(num_bytes);
        buf.extend_from_slice(&delta.to_le_bytes()[..num_bytes as usize]);
        self.write(&buf)
    }
}
