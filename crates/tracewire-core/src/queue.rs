//! Producer-to-consumer chunk hand-off.
//!
//! Providers flush completed chunks here; the single session consumer drains
//! them to the wire in FIFO order. Within one provider that order is the
//! event write order; across providers the queue interleaves in flush order,
//! with no cross-provider guarantee.
//!
//! Chunk ownership moves *into* the queue on push and *out* on pop; a chunk
//! is never visible in the queue and anywhere else at the same time.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::chunk::EventChunk;
use crate::pool::ChunkPool;

/// Unbounded FIFO of chunks awaiting transmission.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    inner: Mutex<VecDeque<Box<EventChunk>>>,
}

impl ChunkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk to the tail.
    pub fn push(&self, chunk: Box<EventChunk>) {
        self.inner.lock().push_back(chunk);
    }

    /// Removes and returns the head chunk, if any.
    #[must_use]
    pub fn try_pop(&self) -> Option<Box<EventChunk>> {
        self.inner.lock().pop_front()
    }

    /// Number of queued chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` if no chunks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns every queued chunk to `pool`. Used at session teardown so
    /// undelivered chunks are recycled rather than leaked.
    pub fn drain_into(&self, pool: &ChunkPool) {
        let chunks = std::mem::take(&mut *self.inner.lock());
        for chunk in chunks {
            pool.release(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn test_fifo_order() {
        let queue = ChunkQueue::new();
        for tag in 1..=3u8 {
            let mut chunk = EventChunk::new_boxed();
            chunk.write(&[tag]).unwrap();
            queue.push(chunk);
        }
        assert_eq!(queue.len(), 3);

        for tag in 1..=3u8 {
            let chunk = queue.try_pop().unwrap();
            assert_eq!(chunk.bytes(), &[tag]);
        }
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_into_pool() {
        let pool = ChunkPool::new(&PoolConfig::default());
        let queue = ChunkQueue::new();
        for _ in 0..3 {
            queue.push(pool.allocate().unwrap());
        }

        queue.drain_into(&pool);
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 3);
    }
}
