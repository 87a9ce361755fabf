//! Per-connection session state machine.
//!
//! One session services one accepted connection. Its poll loop runs a
//! control-plane cycle — `Receive → Process → Send → Receive` — and pushes
//! buffered event data opportunistically whenever the control plane would
//! otherwise sit idle waiting for input:
//!
//! ```text
//!        ┌────────── Receive ◄────────────┐
//!        │ payload      │ nothing pending │
//!        ▼              ▼                 │
//!     Process      send_event_data        │
//!        │         (drain chunk queue     │
//!        ▼          in bounded packets)   │
//!      Send ──────────────────────────────┘
//! ```
//!
//! Nothing here blocks: transport attempts report would-block distinctly
//! from hard failures, a full send window simply re-runs on the next tick,
//! and a partially sent chunk keeps its `{chunk, bytes_sent}` cursor so the
//! next tick resumes mid-chunk instead of re-sending.
//!
//! Any hard transport failure or malformed control payload is fatal to this
//! session only; teardown returns every chunk the session still owns to the
//! pool and notifies the registry, which disables providers and frees the
//! session slot.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use tracewire_core::chunk::EventChunk;
use tracewire_core::pool::TRIM_INTERVAL;
use tracewire_core::queue::ChunkQueue;

use crate::protocol::{wire_result, ProtocolError, Request, Response, MAX_EVENT_DATA_SIZE};
use crate::server::{ApplyUpdatesError, EventServer, SessionId};
use crate::transport::{BlockStore, Transport, TryRecvError, TrySendError};

/// A session-fatal failure. The owning connection tears the session down;
/// sibling providers and the registry are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The transport peer is gone (end of stream or hard send failure).
    #[error("session transport disconnected")]
    Disconnected,

    /// The client sent an unparseable control payload.
    #[error("malformed control payload: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Control-plane position, carrying the in-flight message.
#[derive(Debug)]
enum State {
    /// Waiting for the next control payload.
    Receive,
    /// A decoded request awaiting dispatch.
    Process(Request),
    /// An encoded response awaiting a send window.
    Send(Vec<u8>),
}

/// Cursor into the chunk currently being streamed out.
struct SendCursor {
    chunk: Box<EventChunk>,
    bytes_sent: usize,
}

/// The single active consumer of a server's event data.
pub struct EventServerSession<T: Transport> {
    id: SessionId,
    server: Arc<EventServer>,
    transport: T,
    blocks: Arc<dyn BlockStore>,
    /// Hand-off queue this session drains; providers push into it while
    /// subscribed.
    queue: Arc<ChunkQueue>,
    state: State,
    /// Event-data packet that hit a full send window, retried first.
    pending_packet: Option<Vec<u8>>,
    cursor: Option<SendCursor>,
    /// Lazily allocated block the client writes enablement updates into.
    update_block: Option<u32>,
    /// Providers this session is the data sink for.
    subscribed: Vec<u32>,
    last_maintenance: Instant,
    terminated: bool,
}

impl<T: Transport> EventServerSession<T> {
    pub(crate) fn new(
        id: SessionId,
        server: Arc<EventServer>,
        transport: T,
        blocks: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            id,
            server,
            transport,
            blocks,
            queue: Arc::new(ChunkQueue::new()),
            state: State::Receive,
            pending_packet: None,
            cursor: None,
            update_block: None,
            subscribed: Vec::new(),
            last_maintenance: Instant::now(),
            terminated: false,
        }
    }

    /// This session's identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Number of chunks queued for transmission.
    #[must_use]
    pub fn queued_chunks(&self) -> usize {
        self.queue.len()
    }

    /// Runs one poll-loop tick: drives the control plane as far as it can go
    /// without blocking, streaming event data whenever the control plane is
    /// idle.
    ///
    /// # Errors
    ///
    /// A [`SessionError`] is fatal to the session; the caller stops polling
    /// and drops (or [`terminate`](Self::terminate)s) it.
    pub fn update(&mut self) -> Result<(), SessionError> {
        self.maintain();
        loop {
            match std::mem::replace(&mut self.state, State::Receive) {
                State::Receive => match self.transport.try_recv() {
                    Ok(payload) => {
                        let request = Request::decode(&payload)?;
                        trace!(session = %self.id, ?request, "control request");
                        self.state = State::Process(request);
                    }
                    Err(TryRecvError::Empty) => {
                        // Idle control plane: push buffered event data.
                        return self.send_event_data();
                    }
                    Err(TryRecvError::Disconnected) => return Err(SessionError::Disconnected),
                },
                State::Process(request) => {
                    self.state = self.process(&request);
                }
                State::Send(payload) => match self.transport.try_send(&payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full) => {
                        // Keep the response; retry on the next tick.
                        self.state = State::Send(payload);
                        return Ok(());
                    }
                    Err(TrySendError::Closed) => return Err(SessionError::Disconnected),
                },
            }
        }
    }

    /// Dispatches one control request, producing the next state.
    fn process(&mut self, request: &Request) -> State {
        match request {
            Request::QueryProviders => {
                let block_id = self.server.build_catalog(&*self.blocks);
                State::Send(
                    Response::QueryProviders {
                        result: wire_result::SUCCESS,
                        block_id,
                    }
                    .encode(),
                )
            }
            Request::AllocateProviderUpdates { data_size } => {
                let block_id = match self.update_block {
                    Some(id) => id,
                    None => {
                        let id = self.blocks.allocate(*data_size);
                        self.update_block = Some(id);
                        id
                    }
                };
                State::Send(
                    Response::AllocateProviderUpdates {
                        result: wire_result::SUCCESS,
                        block_id,
                    }
                    .encode(),
                )
            }
            Request::ApplyProviderUpdates => {
                let result = match self.update_block.and_then(|id| self.blocks.read(id)) {
                    Some(data) => match self.server.apply_updates(&data) {
                        Ok(()) => wire_result::SUCCESS,
                        Err(ApplyUpdatesError::Update(_)) => wire_result::INVALID_PARAMETER,
                        Err(ApplyUpdatesError::Protocol(_)) => wire_result::ERROR,
                    },
                    // Nothing was allocated or written beforehand.
                    None => wire_result::UNAVAILABLE,
                };
                State::Send(Response::ApplyProviderUpdates { result }.encode())
            }
            Request::SubscribeToProvider { provider_id } => {
                let result = match self
                    .server
                    .subscribe(*provider_id, Arc::clone(&self.queue))
                {
                    Ok(()) => {
                        if !self.subscribed.contains(provider_id) {
                            self.subscribed.push(*provider_id);
                        }
                        wire_result::SUCCESS
                    }
                    Err(_) => wire_result::UNAVAILABLE,
                };
                State::Send(Response::SubscribeToProvider { result }.encode())
            }
            Request::UnsubscribeFromProvider => {
                // Fire-and-forget: no response is defined for unsubscribe.
                for provider_id in self.subscribed.drain(..) {
                    self.server.unsubscribe(provider_id);
                }
                State::Receive
            }
        }
    }

    /// Best-effort data-plane push: retries a pending packet, then streams
    /// the in-flight chunk (or the next queued one) in bounded packets
    /// until the send window fills or the queue runs dry.
    fn send_event_data(&mut self) -> Result<(), SessionError> {
        if let Some(packet) = self.pending_packet.take() {
            match self.transport.try_send(&packet) {
                Ok(()) => {}
                Err(TrySendError::Full) => {
                    self.pending_packet = Some(packet);
                    return Ok(());
                }
                Err(TrySendError::Closed) => return Err(SessionError::Disconnected),
            }
        }

        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                match self.queue.try_pop() {
                    Some(chunk) if chunk.is_empty() => {
                        // Defensive: providers do not queue empty chunks.
                        self.server.pool().release(chunk);
                        continue;
                    }
                    Some(chunk) => {
                        self.cursor = Some(SendCursor {
                            chunk,
                            bytes_sent: 0,
                        });
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            let remaining = &cursor.chunk.bytes()[cursor.bytes_sent..];
            let take = remaining.len().min(MAX_EVENT_DATA_SIZE);
            let packet = Response::EventData(remaining[..take].to_vec()).encode();
            let consumed = cursor.bytes_sent + take == cursor.chunk.data_size();

            match self.transport.try_send(&packet) {
                Ok(()) => {
                    cursor.bytes_sent += take;
                }
                Err(TrySendError::Full) => {
                    // The packet's bytes are consumed from the chunk; the
                    // packet itself waits for the next tick.
                    cursor.bytes_sent += take;
                    self.pending_packet = Some(packet);
                    if consumed {
                        if let Some(cursor) = self.cursor.take() {
                            self.server.pool().release(cursor.chunk);
                        }
                    }
                    return Ok(());
                }
                Err(TrySendError::Closed) => return Err(SessionError::Disconnected),
            }

            if consumed {
                if let Some(cursor) = self.cursor.take() {
                    self.server.pool().release(cursor.chunk);
                }
            }
        }
    }

    /// Periodic maintenance driven off session activity: advisory provider
    /// flush ticks plus a pool trim cycle.
    fn maintain(&mut self) {
        if self.last_maintenance.elapsed() < TRIM_INTERVAL {
            return;
        }
        self.last_maintenance = Instant::now();
        self.server.update_providers();
        self.server.pool().try_trim();
    }

    /// Tears the session down explicitly. Equivalent to dropping it.
    pub fn terminate(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Some(block_id) = self.update_block.take() {
            self.blocks.discard(block_id);
        }
        // Clear provider sinks first: after this no chunk can reach the
        // queue, so the drain below is complete.
        self.server.terminate_session(self.id);
        if let Some(cursor) = self.cursor.take() {
            self.server.pool().release(cursor.chunk);
        }
        self.queue.drain_into(self.server.pool());
        self.pending_packet = None;
        debug!(session = %self.id, "session torn down");
    }
}

impl<T: Transport> Drop for EventServerSession<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<T: Transport> std::fmt::Debug for EventServerSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServerSession")
            .field("id", &self.id)
            .field("queued_chunks", &self.queued_chunks())
            .field("subscribed", &self.subscribed)
            .finish_non_exhaustive()
    }
}
