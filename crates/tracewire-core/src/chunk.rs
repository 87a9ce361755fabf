//! Fixed-capacity event chunks.
//!
//! An [`EventChunk`] is the unit of allocation, queuing, and network transfer
//! for buffered event data. The struct totals exactly 64 KiB (a power of two,
//! to avoid per-allocation slack) with a 4-byte fill cursor up front and the
//! packed token bytes behind it.
//!
//! Chunks are heap-allocated and moved between owners (producer stream, pool
//! free list, hand-off queue, session send cursor). Because every transfer is
//! a move of the `Box`, a chunk can never be observed by two owners at once,
//! and a released chunk cannot be written again.

/// Total size of an [`EventChunk`] in bytes, including the fill cursor.
pub const CHUNK_TOTAL_SIZE: usize = 64 * 1024;

/// Number of payload bytes a chunk can hold.
///
/// The fill cursor is carved out of the 64 KiB so the whole struct lands on a
/// power of two.
pub const CHUNK_DATA_CAPACITY: usize = CHUNK_TOTAL_SIZE - std::mem::size_of::<u32>();

const _: () = assert!(CHUNK_TOTAL_SIZE.is_power_of_two());

/// A write did not fit in the remaining buffer space.
///
/// Recoverable by the caller: stop writing to this chunk run and either move
/// on to freshly allocated chunks or drop the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("insufficient chunk space remaining")]
pub struct OutOfSpace;

/// Fixed-capacity buffer holding packed event tokens.
pub struct EventChunk {
    /// Number of valid bytes in `data`. Invariant: `data_size <= CHUNK_DATA_CAPACITY`.
    data_size: u32,
    /// Packed token bytes.
    data: [u8; CHUNK_DATA_CAPACITY],
}

impl EventChunk {
    /// Allocates a new zeroed chunk on the heap.
    #[must_use]
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self {
            data_size: 0,
            data: [0; CHUNK_DATA_CAPACITY],
        })
    }

    /// Returns the number of valid bytes in the chunk.
    #[inline]
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_size as usize
    }

    /// Returns the number of bytes still available for writing.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        CHUNK_DATA_CAPACITY - self.data_size()
    }

    /// Returns `true` if the chunk holds no data.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    /// Returns `true` if the chunk is completely filled.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.data_size() == CHUNK_DATA_CAPACITY
    }

    /// Returns the valid bytes written so far.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.data_size()]
    }

    /// Appends raw bytes to the chunk.
    ///
    /// All-or-nothing: if `bytes` exceeds the remaining capacity, nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfSpace`] if the data does not fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), OutOfSpace> {
        if bytes.len() > self.remaining() {
            return Err(OutOfSpace);
        }
        let start = self.data_size();
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.data_size += bytes.len() as u32;
        Ok(())
    }

    /// Clears the chunk for reuse. The payload bytes are not scrubbed; only
    /// the fill cursor is reset.
    #[inline]
    pub fn reset(&mut self) {
        self.data_size = 0;
    }
}

impl std::fmt::Debug for EventChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChunk")
            .field("data_size", &self.data_size)
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk_empty() {
        let chunk = EventChunk::new_boxed();
        assert!(chunk.is_empty());
        assert!(!chunk.is_full());
        assert_eq!(chunk.data_size(), 0);
        assert_eq!(chunk.remaining(), CHUNK_DATA_CAPACITY);
    }

    #[test]
    fn test_write_advances_cursor() {
        let mut chunk = EventChunk::new_boxed();
        chunk.write(&[1, 2, 3]).unwrap();
        assert_eq!(chunk.data_size(), 3);
        assert_eq!(chunk.bytes(), &[1, 2, 3]);
        chunk.write(&[4]).unwrap();
        assert_eq!(chunk.bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let mut chunk = EventChunk::new_boxed();
        let filler = vec![0xAB; CHUNK_DATA_CAPACITY - 2];
        chunk.write(&filler).unwrap();

        // Three bytes cannot fit in the remaining two.
        assert_eq!(chunk.write(&[1, 2, 3]), Err(OutOfSpace));
        assert_eq!(chunk.data_size(), CHUNK_DATA_CAPACITY - 2);

        // Exactly two bytes still fit.
        chunk.write(&[1, 2]).unwrap();
        assert!(chunk.is_full());
        assert_eq!(chunk.write(&[]), Ok(()));
        assert_eq!(chunk.write(&[9]), Err(OutOfSpace));
    }

    #[test]
    fn test_reset() {
        let mut chunk = EventChunk::new_boxed();
        chunk.write(&[1, 2, 3]).unwrap();
        chunk.reset();
        assert!(chunk.is_empty());
        assert_eq!(chunk.remaining(), CHUNK_DATA_CAPACITY);
    }
}
