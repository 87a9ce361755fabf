//! Event providers.
//!
//! A provider owns one logical event stream: a set of bit-indexed events, a
//! monotonically increasing event index, and the ordered list of chunks
//! holding tokens not yet flushed to the session. Producer threads call
//! [`EventProvider::write_event`] concurrently; one mutex per provider
//! serializes stream mutations and is never held across a transport call.
//!
//! Writes are best-effort by contract. The event index is claimed on every
//! attempt — including refused and dropped writes — so a reader counts loss
//! by observing gaps between the indices that did reach the wire.
//!
//! ## Flush cadence
//!
//! The flush timer is checked by whoever holds the stream lock: every write
//! re-checks it after serializing, and [`EventProvider::update`] is only an
//! advisory `try_lock` tick for quiet periods. A producer writing at volume
//! is therefore its own flusher; contention on the advisory path is a
//! silent no-op.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use tracewire_core::chunk::EventChunk;
use tracewire_core::pool::ChunkPool;
use tracewire_core::queue::ChunkQueue;
use tracewire_core::time::{DeltaEncoder, TimeSource, TimestampEncoding};
use tracewire_core::token::{
    DATA_TOKEN_SIZE, PROVIDER_TOKEN_SIZE, TIMESTAMP_TOKEN_SIZE, TOKEN_HEADER_SIZE,
};
use tracewire_core::writer::ChunkWriter;

use crate::protocol::{bitmap_bytes, ProviderCatalogEntry, ENCODING_VERSION};

/// Provider token footprint including its header byte.
const PROVIDER_TOKEN_BYTES: usize = TOKEN_HEADER_SIZE + PROVIDER_TOKEN_SIZE;
/// Data token footprint including its header byte.
const DATA_TOKEN_BYTES: usize = TOKEN_HEADER_SIZE + DATA_TOKEN_SIZE;
/// Worst-case timestamp footprint (a full timestamp token).
const TIMESTAMP_TOKEN_BYTES: usize = TOKEN_HEADER_SIZE + TIMESTAMP_TOKEN_SIZE;

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How long buffered chunks may sit before a flush hands them to the
    /// session queue.
    pub flush_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(16),
        }
    }
}

/// A write attempt did not reach the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteEventError {
    /// The provider is not registered with an event server.
    #[error("provider is not registered with an event server")]
    Unregistered,

    /// The provider, or this specific event, is disabled.
    #[error("provider or event is disabled")]
    Disabled,

    /// The chunk pool refused to grow; the event was dropped.
    #[error("insufficient chunk memory, event dropped")]
    InsufficientMemory,
}

/// An enablement update failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The supplied bitmap does not cover the provider's declared events.
    #[error("enablement bitmap is {got} bytes, needs {expected} for {num_events} events")]
    BitmapTooSmall {
        /// Bytes supplied.
        got: usize,
        /// Bytes required.
        expected: usize,
        /// Declared event count.
        num_events: u32,
    },
}

// ---------------------------------------------------------------------------
// EventProvider
// ---------------------------------------------------------------------------

/// Stream state guarded by the per-provider mutex.
struct StreamState {
    /// Chunk source; present while registered.
    pool: Option<Arc<ChunkPool>>,
    /// Destination queue; present while a session is subscribed.
    sink: Option<Arc<ChunkQueue>>,
    /// Chunks of the current, not-yet-flushed stream, in write order.
    chunks: Vec<Box<EventChunk>>,
    /// Whether the current stream has its opening provider token.
    started: bool,
    encoder: DeltaEncoder,
    last_flush: Instant,
}

/// A registered source of timestamped events.
pub struct EventProvider {
    provider_id: u32,
    name: String,
    num_events: u32,
    description: Vec<u8>,
    config: ProviderConfig,
    clock: Arc<dyn TimeSource>,
    registered: AtomicBool,
    enabled: AtomicBool,
    /// Next event index; incremented on every write attempt.
    event_index: AtomicU32,
    /// Per-event enablement bits, one word per 32 events.
    event_bits: Mutex<Vec<u32>>,
    stream: Mutex<StreamState>,
}

impl EventProvider {
    /// Creates a provider with default configuration.
    ///
    /// The provider starts disabled with every event bit set: a single
    /// enable call (or a client update) opens the whole stream.
    #[must_use]
    pub fn new(
        provider_id: u32,
        name: impl Into<String>,
        num_events: u32,
        description: Vec<u8>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self::with_config(
            provider_id,
            name,
            num_events,
            description,
            clock,
            ProviderConfig::default(),
        )
    }

    /// Creates a provider with explicit configuration.
    #[must_use]
    pub fn with_config(
        provider_id: u32,
        name: impl Into<String>,
        num_events: u32,
        description: Vec<u8>,
        clock: Arc<dyn TimeSource>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            provider_id,
            name: name.into(),
            num_events,
            description,
            config,
            clock,
            registered: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            event_index: AtomicU32::new(0),
            event_bits: Mutex::new(full_bitmap(num_events)),
            stream: Mutex::new(StreamState {
                pool: None,
                sink: None,
                chunks: Vec::new(),
                started: false,
                encoder: DeltaEncoder::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Provider identifier.
    #[must_use]
    pub fn provider_id(&self) -> u32 {
        self.provider_id
    }

    /// Human-readable provider name (not part of the wire catalog).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events this provider declares.
    #[must_use]
    pub fn num_events(&self) -> u32 {
        self.num_events
    }

    /// The next event index a write attempt will claim. Equals the total
    /// number of attempts so far.
    #[must_use]
    pub fn event_index(&self) -> u32 {
        self.event_index.load(Ordering::Acquire)
    }

    // --- Enablement ---

    /// Returns `true` while the provider-level enable bit is set.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Sets the provider-level enable bit.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        debug!(provider = self.provider_id, name = %self.name, "provider enabled");
    }

    /// Clears the provider-level enable bit. In-flight writes complete;
    /// later attempts are refused.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        debug!(provider = self.provider_id, name = %self.name, "provider disabled");
    }

    /// Returns `true` if `event_id` is declared and its bit is set.
    #[must_use]
    pub fn event_enabled(&self, event_id: u32) -> bool {
        if event_id >= self.num_events {
            return false;
        }
        let bits = self.event_bits.lock();
        bits[(event_id / 32) as usize] & (1 << (event_id % 32)) != 0
    }

    /// Sets or clears one event's enablement bit. Out-of-range ids are
    /// ignored.
    pub fn set_event_enabled(&self, event_id: u32, enabled: bool) {
        if event_id >= self.num_events {
            return;
        }
        let mut bits = self.event_bits.lock();
        let word = &mut bits[(event_id / 32) as usize];
        if enabled {
            *word |= 1 << (event_id % 32);
        } else {
            *word &= !(1 << (event_id % 32));
        }
    }

    /// Applies a client enablement update: the provider flag plus the whole
    /// event bitmap, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::BitmapTooSmall`] — without mutating any state —
    /// if `bitmap` does not cover the declared event count.
    pub fn apply_update(&self, is_enabled: bool, bitmap: &[u8]) -> Result<(), UpdateError> {
        if (bitmap.len() as u64) * 8 < u64::from(self.num_events) {
            return Err(UpdateError::BitmapTooSmall {
                got: bitmap.len(),
                expected: bitmap_bytes(self.num_events),
                num_events: self.num_events,
            });
        }
        let mut bits = self.event_bits.lock();
        for (word_index, word) in bits.iter_mut().enumerate() {
            let mut value = 0u32;
            for byte in 0..4 {
                let index = word_index * 4 + byte;
                if index < bitmap.len() {
                    value |= u32::from(bitmap[index]) << (byte * 8);
                }
            }
            *word = value;
        }
        drop(bits);
        self.enabled.store(is_enabled, Ordering::Release);
        debug!(
            provider = self.provider_id,
            enabled = is_enabled,
            "provider update applied"
        );
        Ok(())
    }

    // --- Event writes ---

    /// Writes one event with the given payload. See
    /// [`write_event_with_header`](Self::write_event_with_header).
    ///
    /// # Errors
    ///
    /// Same contract as [`write_event_with_header`](Self::write_event_with_header).
    pub fn write_event(&self, event_id: u32, payload: &[u8]) -> Result<(), WriteEventError> {
        self.write_event_with_header(event_id, &[], payload)
    }

    /// Writes one event whose payload is the concatenation of `header` and
    /// `payload` bytes.
    ///
    /// Best-effort: the event index is claimed on every attempt, so failed
    /// writes leave an index gap the consumer can count.
    ///
    /// # Errors
    ///
    /// - [`WriteEventError::Unregistered`] — not attached to a server
    /// - [`WriteEventError::Disabled`] — provider or event bit is off
    /// - [`WriteEventError::InsufficientMemory`] — the pool refused to grow;
    ///   the event was dropped
    pub fn write_event_with_header(
        &self,
        event_id: u32,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), WriteEventError> {
        if !self.registered.load(Ordering::Acquire) {
            self.event_index.fetch_add(1, Ordering::AcqRel);
            return Err(WriteEventError::Unregistered);
        }
        if !self.is_enabled() || !self.event_enabled(event_id) {
            self.event_index.fetch_add(1, Ordering::AcqRel);
            return Err(WriteEventError::Disabled);
        }

        let mut stream = self.stream.lock();
        let index = self.event_index.fetch_add(1, Ordering::AcqRel);
        let result = self.write_locked(&mut stream, event_id, index, header, payload);
        // Whoever holds the lock checks the flush timer.
        self.flush_if_due(&mut stream);
        result
    }

    fn write_locked(
        &self,
        stream: &mut StreamState,
        event_id: u32,
        index: u32,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), WriteEventError> {
        let total_payload = header.len() + payload.len();
        let mut required = TIMESTAMP_TOKEN_BYTES + DATA_TOKEN_BYTES + total_payload;
        if !stream.started {
            required += PROVIDER_TOKEN_BYTES;
        }
        if let Err(err) = reserve(stream, required) {
            debug!(
                provider = self.provider_id,
                event = event_id,
                index,
                "event dropped under memory pressure"
            );
            return Err(err);
        }

        let now = self.clock.now_ticks();
        let frequency = self.clock.frequency();

        let StreamState {
            chunks,
            started,
            encoder,
            ..
        } = stream;
        let first_writable = chunks
            .iter()
            .position(|c| !c.is_full())
            .unwrap_or(chunks.len());
        let mut writer = ChunkWriter::new(&mut chunks[first_writable..]);

        // The reservation covers the worst case, so these cannot fail; the
        // mapping below is belt-and-braces rather than a reachable path.
        if !*started {
            writer
                .provider_token(self.provider_id, frequency, now)
                .map_err(|_| WriteEventError::InsufficientMemory)?;
            encoder.rebase(now);
            *started = true;
        }
        let small_delta = match encoder.encode(now) {
            TimestampEncoding::Small(delta) => delta,
            TimestampEncoding::Delta { value, num_bytes } => {
                writer
                    .time_delta_token(value, num_bytes)
                    .map_err(|_| WriteEventError::InsufficientMemory)?;
                0
            }
            TimestampEncoding::Full => {
                writer
                    .timestamp_token(frequency, now)
                    .map_err(|_| WriteEventError::InsufficientMemory)?;
                0
            }
        };
        writer
            .data_token(small_delta, event_id, index, total_payload as u64)
            .map_err(|_| WriteEventError::InsufficientMemory)?;
        if !header.is_empty() {
            writer
                .write(header)
                .map_err(|_| WriteEventError::InsufficientMemory)?;
        }
        writer
            .write(payload)
            .map_err(|_| WriteEventError::InsufficientMemory)?;
        Ok(())
    }

    // --- Flushing ---

    /// Advisory flush tick. Attempts the stream lock without blocking; under
    /// contention the active writer performs the flush check itself.
    pub fn update(&self) {
        if let Some(mut stream) = self.stream.try_lock() {
            self.flush_if_due(&mut stream);
        }
    }

    /// Hands all buffered chunks to the subscribed session queue, or back to
    /// the pool when nothing is subscribed.
    pub fn flush(&self) {
        let mut stream = self.stream.lock();
        self.flush_locked(&mut stream);
    }

    fn flush_if_due(&self, stream: &mut StreamState) {
        if stream.last_flush.elapsed() >= self.config.flush_interval {
            self.flush_locked(stream);
        }
    }

    fn flush_locked(&self, stream: &mut StreamState) {
        stream.last_flush = Instant::now();
        if stream.chunks.is_empty() {
            return;
        }
        let chunks = std::mem::take(&mut stream.chunks);
        let count = chunks.len();
        stream.started = false;
        stream.encoder.reset();

        if let Some(sink) = &stream.sink {
            for chunk in chunks {
                if chunk.is_empty() {
                    // Spare capacity acquired but never written.
                    if let Some(pool) = &stream.pool {
                        pool.release(chunk);
                    }
                } else {
                    sink.push(chunk);
                }
            }
            trace!(provider = self.provider_id, count, "flushed event chunks");
        } else if let Some(pool) = &stream.pool {
            for chunk in chunks {
                pool.release(chunk);
            }
            trace!(
                provider = self.provider_id,
                count,
                "discarded chunks with no subscriber"
            );
        }
    }

    // --- Lifecycle (driven by the server) ---

    pub(crate) fn attach(&self, pool: Arc<ChunkPool>) {
        let mut stream = self.stream.lock();
        stream.pool = Some(pool);
        stream.last_flush = Instant::now();
        self.registered.store(true, Ordering::Release);
    }

    /// Detaches from the server, force-flushing buffered data first so
    /// nothing is silently discarded on shutdown.
    pub(crate) fn detach(&self) {
        self.registered.store(false, Ordering::Release);
        let mut stream = self.stream.lock();
        self.flush_locked(&mut stream);
        stream.sink = None;
        stream.pool = None;
    }

    pub(crate) fn set_sink(&self, sink: Option<Arc<ChunkQueue>>) {
        self.stream.lock().sink = sink;
    }

    /// The active session went away: disable so no further writes target a
    /// dead sink, and recycle anything still buffered.
    pub(crate) fn on_session_terminated(&self) {
        self.disable();
        let mut stream = self.stream.lock();
        stream.sink = None;
        let chunks = std::mem::take(&mut stream.chunks);
        if let Some(pool) = &stream.pool {
            for chunk in chunks {
                pool.release(chunk);
            }
        }
        stream.started = false;
        stream.encoder.reset();
    }

    pub(crate) fn catalog_entry(&self) -> ProviderCatalogEntry {
        let bits = self.event_bits.lock();
        let mut bitmap = Vec::with_capacity(bits.len() * 4);
        for word in bits.iter() {
            bitmap.extend_from_slice(&word.to_le_bytes());
        }
        ProviderCatalogEntry {
            provider_id: self.provider_id,
            num_events: self.num_events,
            is_enabled: self.is_enabled(),
            version: ENCODING_VERSION,
            bitmap,
            description: self.description.clone(),
        }
    }
}

impl std::fmt::Debug for EventProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProvider")
            .field("provider_id", &self.provider_id)
            .field("name", &self.name)
            .field("num_events", &self.num_events)
            .field("enabled", &self.is_enabled())
            .field("event_index", &self.event_index())
            .finish_non_exhaustive()
    }
}

fn reserve(stream: &mut StreamState, required: usize) -> Result<(), WriteEventError> {
    let Some(pool) = stream.pool.clone() else {
        return Err(WriteEventError::Unregistered);
    };
    let mut available: usize = stream.chunks.iter().map(|c| c.remaining()).sum();
    while available < required {
        match pool.allocate() {
            Some(chunk) => {
                available += chunk.remaining();
                stream.chunks.push(chunk);
            }
            None => return Err(WriteEventError::InsufficientMemory),
        }
    }
    Ok(())
}

/// Bitmap with every declared event's bit set.
fn full_bitmap(num_events: u32) -> Vec<u32> {
    let words = num_events.div_ceil(32) as usize;
    let mut bits = vec![u32::MAX; words];
    let tail = num_events % 32;
    if tail != 0 {
        if let Some(last) = bits.last_mut() {
            *last = (1u32 << tail) - 1;
        }
    }
    bits
}

// ===========================================================================
// Tests
// ===========================================================================
