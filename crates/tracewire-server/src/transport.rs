//! Session transport and bulk-transfer collaborators.
//!
//! The pipeline never blocks on the network: both directions are expressed
//! as non-blocking attempts with a would-block sentinel ([`TrySendError::Full`]
//! / [`TryRecvError::Empty`]) kept distinct from hard failures. The caller's
//! poll loop supplies the retry cadence.
//!
//! Bulk payloads (the provider catalog, batched enablement updates) bypass
//! the packet path entirely through a [`BlockStore`], an out-of-band channel
//! addressed by block id.
//!
//! [`loopback_pair`] and [`InMemoryBlockStore`] are in-process
//! implementations with a bounded in-flight window, used by the test suite
//! to exercise would-block and disconnect paths deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::protocol::{BlockId, MAX_TRANSPORT_PAYLOAD};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A send attempt could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError {
    /// The send window is full; retry on the next tick.
    #[error("transport send window is full")]
    Full,
    /// The peer is gone. Fatal to the session.
    #[error("transport is closed")]
    Closed,
}

/// A receive attempt could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing pending; retry on the next tick.
    #[error("no payload pending")]
    Empty,
    /// The peer is gone and all pending payloads were drained.
    #[error("transport is disconnected")]
    Disconnected,
}

/// Reliable, session-addressed, non-blocking message transport.
pub trait Transport: Send {
    /// Attempts to send one payload without blocking.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] when the transport would block;
    /// [`TrySendError::Closed`] when the peer is gone.
    fn try_send(&mut self, payload: &[u8]) -> Result<(), TrySendError>;

    /// Attempts to receive one payload without blocking.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] when nothing is pending;
    /// [`TryRecvError::Disconnected`] when the peer is gone.
    fn try_recv(&mut self) -> Result<Vec<u8>, TryRecvError>;

    /// Largest payload one message may carry.
    fn max_payload(&self) -> usize {
        MAX_TRANSPORT_PAYLOAD
    }
}

// ---------------------------------------------------------------------------
// Loopback transport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Pipe {
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            closed: AtomicBool::new(false),
        })
    }
}

/// One endpoint of an in-process duplex transport.
///
/// Each direction holds at most `capacity` in-flight payloads; a full window
/// reports [`TrySendError::Full`], which is how tests exercise the session's
/// mid-chunk resume path. Dropping either endpoint closes the connection;
/// the peer drains what was already sent, then sees `Disconnected`.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
}

/// Creates a connected pair of loopback endpoints with the given per-
/// direction capacity.
#[must_use]
pub fn loopback_pair(capacity: usize) -> (LoopbackTransport, LoopbackTransport) {
    let a_to_b = Pipe::new(capacity);
    let b_to_a = Pipe::new(capacity);
    (
        LoopbackTransport {
            tx: Arc::clone(&a_to_b),
            rx: Arc::clone(&b_to_a),
        },
        LoopbackTransport {
            tx: b_to_a,
            rx: a_to_b,
        },
    )
}

impl Transport for LoopbackTransport {
    fn try_send(&mut self, payload: &[u8]) -> Result<(), TrySendError> {
        debug_assert!(payload.len() <= self.max_payload());
        if self.tx.closed.load(Ordering::Acquire) {
            return Err(TrySendError::Closed);
        }
        let mut queue = self.tx.queue.lock();
        if queue.len() >= self.tx.capacity {
            return Err(TrySendError::Full);
        }
        queue.push_back(payload.to_vec());
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, TryRecvError> {
        if let Some(payload) = self.rx.queue.lock().pop_front() {
            return Ok(payload);
        }
        if self.rx.closed.load(Ordering::Acquire) {
            return Err(TryRecvError::Disconnected);
        }
        Err(TryRecvError::Empty)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.tx.closed.store(true, Ordering::Release);
        self.rx.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Block store
// ---------------------------------------------------------------------------

/// Out-of-band bulk-transfer channel, addressed by [`BlockId`].
pub trait BlockStore: Send + Sync {
    /// Stores server-produced data and returns its block id.
    fn publish(&self, data: Vec<u8>) -> BlockId;

    /// Reserves an empty block the client will fill. `size_hint` is the
    /// client's declared write size.
    fn allocate(&self, size_hint: u32) -> BlockId;

    /// Replaces the contents of an allocated block. Returns `false` for an
    /// unknown id.
    fn write(&self, id: BlockId, data: Vec<u8>) -> bool;

    /// Reads a block's current contents.
    fn read(&self, id: BlockId) -> Option<Vec<u8>>;

    /// Releases a block.
    fn discard(&self, id: BlockId);
}

/// Heap-backed [`BlockStore`].
#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: Mutex<FxHashMap<BlockId, Vec<u8>>>,
    next_id: AtomicU32,
}

impl InMemoryBlockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn publish(&self, data: Vec<u8>) -> BlockId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert(id, data);
        id
    }

    fn allocate(&self, size_hint: u32) -> BlockId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .lock()
            .insert(id, Vec::with_capacity(size_hint as usize));
        id
    }

    fn write(&self, id: BlockId, data: Vec<u8>) -> bool {
        match self.blocks.lock().get_mut(&id) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }

    fn read(&self, id: BlockId) -> Option<Vec<u8>> {
        self.blocks.lock().get(&id).cloned()
    }

    fn discard(&self, id: BlockId) {
        self.blocks.lock().remove(&id);
    }
}
