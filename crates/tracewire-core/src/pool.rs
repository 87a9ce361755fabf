//! Recycled chunk pool with a soft memory target.
//!
//! Producers allocate chunks far more often than steady-state memory use
//! grows, so freed chunks are cached on a free list and handed back out
//! without touching the allocator. Two bounds keep the pool honest:
//!
//! - a **soft target** (derived from a byte budget, default 4 MiB): the free
//!   list never caches beyond it, and [`ChunkPool::try_trim`] shrinks the
//!   cache back down after the target is lowered at runtime
//! - a **hard live ceiling**: the total number of chunks outstanding anywhere
//!   in the pipeline; once reached, [`ChunkPool::allocate`] refuses and the
//!   caller drops the event
//!
//! Trimming must never compete with a producer under load: it takes the lock
//! with `try_lock` and frees at most [`TRIM_BATCH`] chunks per call. A
//! skipped cycle is harmless, the next tick retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::chunk::{EventChunk, CHUNK_TOTAL_SIZE};

/// Maximum number of chunks released to the allocator per trim call.
pub const TRIM_BATCH: usize = 16;

/// How often trim runs, measured in session activity.
pub const TRIM_INTERVAL: Duration = Duration::from_millis(16);

/// Chunk pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Byte budget for the cached free list. The target chunk count is
    /// `memory_budget_bytes / CHUNK_TOTAL_SIZE`.
    pub memory_budget_bytes: usize,
    /// Hard ceiling on chunks outstanding anywhere (free list + in use).
    pub max_live_chunks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let budget = 4 * 1024 * 1024;
        Self {
            memory_budget_bytes: budget,
            max_live_chunks: 4 * (budget / CHUNK_TOTAL_SIZE),
        }
    }
}

/// Bounded free list of recycled [`EventChunk`]s.
#[derive(Debug)]
pub struct ChunkPool {
    free: Mutex<Vec<Box<EventChunk>>>,
    /// Soft cache target in chunks. Adjustable at runtime.
    target_chunks: AtomicUsize,
    /// Hard ceiling on live chunks.
    max_live_chunks: usize,
    /// Chunks currently in existence (cached + handed out).
    live_chunks: AtomicUsize,
}

impl ChunkPool {
    /// Creates an empty pool with the given configuration.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            target_chunks: AtomicUsize::new(config.memory_budget_bytes / CHUNK_TOTAL_SIZE),
            max_live_chunks: config.max_live_chunks,
            live_chunks: AtomicUsize::new(0),
        }
    }

    /// Takes a chunk from the free list, or allocates a fresh one while the
    /// live ceiling allows.
    ///
    /// Returns `None` under memory pressure; the caller drops the event it
    /// was buffering (the loss shows up as an event-index gap).
    #[must_use]
    pub fn allocate(&self) -> Option<Box<EventChunk>> {
        if let Some(chunk) = self.free.lock().pop() {
            return Some(chunk);
        }
        let prev = self.live_chunks.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_live_chunks {
            self.live_chunks.fetch_sub(1, Ordering::AcqRel);
            debug!(live = prev, ceiling = self.max_live_chunks, "chunk allocation refused");
            return None;
        }
        Some(EventChunk::new_boxed())
    }

    /// Returns a chunk to the pool.
    ///
    /// The chunk is reset and cached while the free list is below the
    /// target; beyond that it is freed immediately.
    pub fn release(&self, mut chunk: Box<EventChunk>) {
        chunk.reset();
        let mut free = self.free.lock();
        if free.len() < self.target_chunks.load(Ordering::Relaxed) {
            free.push(chunk);
        } else {
            drop(free);
            drop(chunk);
            self.live_chunks.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Frees cached chunks above the target, at most [`TRIM_BATCH`] per
    /// call, and only if the free list is uncontended.
    ///
    /// Returns the number of chunks freed.
    pub fn try_trim(&self) -> usize {
        let Some(mut free) = self.free.try_lock() else {
            return 0;
        };
        let target = self.target_chunks.load(Ordering::Relaxed);
        let excess = free.len().saturating_sub(target);
        let count = excess.min(TRIM_BATCH);
        if count > 0 {
            let new_len = free.len() - count;
            free.truncate(new_len);
            drop(free);
            self.live_chunks.fetch_sub(count, Ordering::AcqRel);
            trace!(count, target, "trimmed chunk pool");
        }
        count
    }

    /// Adjusts the byte budget (and thus the cache target) at runtime.
    ///
    /// Shrinking does not free anything by itself; subsequent trim cycles
    /// walk the cache back down to the new target.
    pub fn set_memory_budget(&self, bytes: usize) {
        self.target_chunks
            .store(bytes / CHUNK_TOTAL_SIZE, Ordering::Relaxed);
    }

    /// Current soft cache target, in chunks.
    #[must_use]
    pub fn target_chunks(&self) -> usize {
        self.target_chunks.load(Ordering::Relaxed)
    }

    /// Returns `true` while the free list holds more than the target.
    #[must_use]
    pub fn is_target_exceeded(&self) -> bool {
        self.free_count() > self.target_chunks()
    }

    /// Number of chunks cached on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of chunks in existence (cached + handed out).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_chunks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_chunks(budget_chunks: usize, max_live: usize) -> ChunkPool {
        ChunkPool::new(&PoolConfig {
            memory_budget_bytes: budget_chunks * CHUNK_TOTAL_SIZE,
            max_live_chunks: max_live,
        })
    }

    #[test]
    fn test_allocate_recycles() {
        let pool = pool_with_chunks(4, 16);
        let mut chunk = pool.allocate().unwrap();
        chunk.write(&[1, 2, 3]).unwrap();
        pool.release(chunk);
        assert_eq!(pool.free_count(), 1);

        // Recycled chunk comes back reset.
        let chunk = pool.allocate().unwrap();
        assert!(chunk.is_empty());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_live_ceiling() {
        let pool = pool_with_chunks(4, 2);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        // Releasing makes room again via the cache.
        pool.release(a);
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn test_release_beyond_target_frees() {
        let pool = pool_with_chunks(2, 16);
        let chunks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.live_count(), 4);
        for chunk in chunks {
            pool.release(chunk);
        }
        // Only the target is cached; the rest went back to the allocator.
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.live_count(), 2);
        assert!(!pool.is_target_exceeded());
    }

    #[test]
    fn test_trim_after_budget_shrink() {
        let pool = pool_with_chunks(8, 64);
        let chunks: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        for chunk in chunks {
            pool.release(chunk);
        }
        assert_eq!(pool.free_count(), 8);

        // Shrink the budget so the cache sits 5 chunks over target.
        pool.set_memory_budget(3 * CHUNK_TOTAL_SIZE);
        assert!(pool.is_target_exceeded());
        assert_eq!(pool.try_trim(), 5);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.live_count(), 3);
        assert!(!pool.is_target_exceeded());

        // Nothing left to trim.
        assert_eq!(pool.try_trim(), 0);
    }

    #[test]
    fn test_trim_is_batched() {
        let pool = pool_with_chunks(TRIM_BATCH + 10, 64);
        let chunks: Vec<_> = (0..TRIM_BATCH + 10)
            .map(|_| pool.allocate().unwrap())
            .collect();
        for chunk in chunks {
            pool.release(chunk);
        }
        pool.set_memory_budget(0);

        assert_eq!(pool.try_trim(), TRIM_BATCH);
        assert_eq!(pool.try_trim(), 10);
        assert_eq!(pool.try_trim(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        use std::sync::Arc;

        let pool = Arc::new(pool_with_chunks(8, 64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(chunk) = pool.allocate() {
                        pool.release(chunk);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        while pool.try_trim() > 0 {}
        assert!(pool.free_count() <= pool.target_chunks());
        assert!(pool.live_count() <= 64);
    }
}
