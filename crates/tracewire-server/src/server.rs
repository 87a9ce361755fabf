//! Event server and provider registry.
//!
//! The server owns the provider map, the shared chunk pool, and the
//! single-active-session invariant. Registry operations (register,
//! unregister, catalog snapshot, enablement updates) take the registry lock;
//! stream operations never do, so unrelated providers are not serialized
//! against each other.
//!
//! The "one active session" rule is modeled as an `Option<SessionId>` owned
//! by the registry: set under the lock on accept, cleared under the same
//! lock on terminate. A second accept while the slot is occupied is refused.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tracewire_core::pool::{ChunkPool, PoolConfig};
use tracewire_core::queue::ChunkQueue;

use crate::protocol::{self, BlockId, ProtocolError};
use crate::provider::{EventProvider, UpdateError};
use crate::session::EventServerSession;
use crate::transport::{BlockStore, Transport};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier of an accepted session.
///
/// Monotonically assigned by [`EventServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Registry operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A provider with this id is already registered.
    #[error("provider id {0:#x} is already registered")]
    DuplicateProvider(u32),

    /// No provider with this id is registered.
    #[error("provider id {0:#x} is not registered")]
    UnknownProvider(u32),
}

/// A connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    /// Another session is already active against this server.
    #[error("a session is already active")]
    SessionActive,
}

/// Failure while applying a batch of provider updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyUpdatesError {
    /// The update block could not be parsed.
    #[error("malformed update block: {0}")]
    Protocol(#[from] ProtocolError),

    /// At least one record failed validation (valid records before and after
    /// it were still applied).
    #[error("invalid provider update: {0}")]
    Update(#[from] UpdateError),
}

// ---------------------------------------------------------------------------
// EventServer
// ---------------------------------------------------------------------------

/// Provider registry plus session admission.
pub struct EventServer {
    providers: Mutex<FxHashMap<u32, Arc<EventProvider>>>,
    pool: Arc<ChunkPool>,
    /// The single active session, owned by the registry.
    active_session: Mutex<Option<SessionId>>,
    next_session_id: AtomicU32,
}

impl EventServer {
    /// Creates a server with a chunk pool built from `pool_config`.
    #[must_use]
    pub fn new(pool_config: &PoolConfig) -> Self {
        Self {
            providers: Mutex::new(FxHashMap::default()),
            pool: Arc::new(ChunkPool::new(pool_config)),
            active_session: Mutex::new(None),
            next_session_id: AtomicU32::new(1),
        }
    }

    /// The shared chunk pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    // --- Provider registry ---

    /// Registers a provider, attaching it to this server's pool.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateProvider`] if the id is taken.
    pub fn register_provider(&self, provider: Arc<EventProvider>) -> Result<(), RegistryError> {
        let mut providers = self.providers.lock();
        let id = provider.provider_id();
        if providers.contains_key(&id) {
            return Err(RegistryError::DuplicateProvider(id));
        }
        provider.attach(Arc::clone(&self.pool));
        info!(provider = id, name = provider.name(), "provider registered");
        providers.insert(id, provider);
        Ok(())
    }

    /// Unregisters a provider, force-flushing its buffered data first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProvider`] if the id is not
    /// registered.
    pub fn unregister_provider(&self, provider_id: u32) -> Result<(), RegistryError> {
        let provider = self
            .providers
            .lock()
            .remove(&provider_id)
            .ok_or(RegistryError::UnknownProvider(provider_id))?;
        provider.detach();
        info!(provider = provider_id, "provider unregistered");
        Ok(())
    }

    /// Looks up a registered provider.
    #[must_use]
    pub fn provider(&self, provider_id: u32) -> Option<Arc<EventProvider>> {
        self.providers.lock().get(&provider_id).cloned()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.providers.lock().len()
    }

    /// Advisory flush tick across every provider. Cheap under contention:
    /// busy providers skip and flush from their own write paths.
    pub fn update_providers(&self) {
        let providers: Vec<_> = self.providers.lock().values().cloned().collect();
        for provider in providers {
            provider.update();
        }
    }

    // --- Discovery and updates ---

    /// Snapshots the provider catalog into a transfer block and returns its
    /// id. The snapshot is taken under the registry lock.
    pub fn build_catalog(&self, blocks: &dyn BlockStore) -> BlockId {
        let providers = self.providers.lock();
        let mut entries: Vec<_> = providers.values().map(|p| p.catalog_entry()).collect();
        // Hash-map iteration order is arbitrary; present a stable catalog.
        entries.sort_by_key(|e| e.provider_id);
        let data = protocol::encode_catalog(&entries);
        drop(providers);

        let block_id = blocks.publish(data);
        debug!(block = block_id, count = entries.len(), "catalog published");
        block_id
    }

    /// Applies a batch of enablement updates from an update block.
    ///
    /// Unknown provider ids are skipped silently; records are applied in
    /// order and the first validation failure is reported after the rest of
    /// the batch has been attempted.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyUpdatesError::Protocol`] for an unparseable block, or
    /// the first [`ApplyUpdatesError::Update`] a record produced.
    pub fn apply_updates(&self, data: &[u8]) -> Result<(), ApplyUpdatesError> {
        let records = protocol::decode_updates(data)?;
        let mut first_failure = None;
        for record in records {
            let Some(provider) = self.provider(record.provider_id) else {
                debug!(provider = record.provider_id, "update for unknown provider skipped");
                continue;
            };
            if let Err(err) = provider.apply_update(record.is_enabled, &record.bitmap) {
                warn!(provider = record.provider_id, %err, "provider update rejected");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    // --- Subscription ---

    /// Makes `sink` the data sink of the given provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProvider`] for an unregistered id.
    pub(crate) fn subscribe(
        &self,
        provider_id: u32,
        sink: Arc<ChunkQueue>,
    ) -> Result<(), RegistryError> {
        let provider = self
            .provider(provider_id)
            .ok_or(RegistryError::UnknownProvider(provider_id))?;
        provider.set_sink(Some(sink));
        debug!(provider = provider_id, "session subscribed");
        Ok(())
    }

    /// Clears the given provider's data sink.
    pub(crate) fn unsubscribe(&self, provider_id: u32) {
        if let Some(provider) = self.provider(provider_id) {
            provider.set_sink(None);
            debug!(provider = provider_id, "session unsubscribed");
        }
    }

    // --- Session admission ---

    /// Accepts a connection, creating the session that will service it.
    /// At most one session may be active at a time.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::SessionActive`] while another session holds
    /// the slot.
    pub fn accept_session<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        blocks: Arc<dyn BlockStore>,
    ) -> Result<EventServerSession<T>, AcceptError> {
        let mut active = self.active_session.lock();
        if active.is_some() {
            return Err(AcceptError::SessionActive);
        }
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        *active = Some(id);
        drop(active);

        info!(%id, "session accepted");
        Ok(EventServerSession::new(
            id,
            Arc::clone(self),
            transport,
            blocks,
        ))
    }

    /// Returns `true` while a session holds the slot.
    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.active_session.lock().is_some()
    }

    /// Releases the session slot and notifies every provider so no further
    /// writes target the dead sink.
    pub(crate) fn terminate_session(&self, id: SessionId) {
        {
            let mut active = self.active_session.lock();
            if *active == Some(id) {
                *active = None;
            }
        }
        let providers: Vec<_> = self.providers.lock().values().cloned().collect();
        for provider in providers {
            provider.on_session_terminated();
        }
        info!(%id, "session terminated");
    }
}

impl std::fmt::Debug for EventServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServer")
            .field("provider_count", &self.provider_count())
            .field("has_active_session", &self.has_active_session())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_catalog, encode_updates, ProviderUpdateRecord};
    use crate::transport::InMemoryBlockStore;
    use tracewire_core::time::ManualClock;
    use tracewire_core::time::TimeSource;

    fn test_provider(id: u32, num_events: u32) -> Arc<EventProvider> {
        let clock: Arc<dyn TimeSource> = Arc::new(ManualClock::new(0));
        Arc::new(EventProvider::new(
            id,
            format!("provider-{id:x}"),
            num_events,
            Vec::new(),
            clock,
        ))
    }

    // --- Registration tests ---

    #[test]
    fn test_register_duplicate_refused() {
        let server = EventServer::new(&PoolConfig::default());
        server.register_provider(test_provider(7, 4)).unwrap();

        assert_eq!(
            server.register_provider(test_provider(7, 8)),
            Err(RegistryError::DuplicateProvider(7))
        );
        assert_eq!(server.provider_count(), 1);
    }

    #[test]
    fn test_unregister_unknown_refused() {
        let server = EventServer::new(&PoolConfig::default());
        assert_eq!(
            server.unregister_provider(42),
            Err(RegistryError::UnknownProvider(42))
        );
    }

    #[test]
    fn test_unregister_detaches() {
        let server = EventServer::new(&PoolConfig::default());
        let provider = test_provider(7, 4);
        server.register_provider(Arc::clone(&provider)).unwrap();
        provider.enable();
        provider.write_event(0, &[1]).unwrap();

        server.unregister_provider(7).unwrap();
        assert!(server.provider(7).is_none());
        assert_eq!(
            provider.write_event(0, &[1]),
            Err(crate::provider::WriteEventError::Unregistered)
        );
    }

    // --- Catalog tests ---

    #[test]
    fn test_catalog_snapshot_sorted() {
        let server = EventServer::new(&PoolConfig::default());
        server.register_provider(test_provider(0x30, 4)).unwrap();
        server.register_provider(test_provider(0x10, 8)).unwrap();
        server.register_provider(test_provider(0x20, 40)).unwrap();

        let blocks = InMemoryBlockStore::new();
        let block_id = server.build_catalog(&blocks);
        let entries = decode_catalog(&blocks.read(block_id).unwrap()).unwrap();

        let ids: Vec<u32> = entries.iter().map(|e| e.provider_id).collect();
        assert_eq!(ids, vec![0x10, 0x20, 0x30]);
        assert_eq!(entries[2].num_events, 4);
        assert!(!entries[0].is_enabled);
    }

    // --- Update tests ---

    #[test]
    fn test_apply_updates_skips_unknown_ids() {
        let server = EventServer::new(&PoolConfig::default());
        let provider = test_provider(5, 8);
        server.register_provider(Arc::clone(&provider)).unwrap();

        let block = encode_updates(&[
            ProviderUpdateRecord {
                provider_id: 999,
                is_enabled: true,
                bitmap: vec![0xFF, 0, 0, 0],
            },
            ProviderUpdateRecord {
                provider_id: 5,
                is_enabled: true,
                bitmap: vec![0xFF, 0, 0, 0],
            },
        ]);

        server.apply_updates(&block).unwrap();
        assert!(provider.is_enabled());
    }

    #[test]
    fn test_apply_updates_reports_first_invalid_record() {
        let server = EventServer::new(&PoolConfig::default());
        let bad = test_provider(1, 16);
        let good = test_provider(2, 8);
        server.register_provider(Arc::clone(&bad)).unwrap();
        server.register_provider(Arc::clone(&good)).unwrap();

        let block = encode_updates(&[
            ProviderUpdateRecord {
                provider_id: 1,
                is_enabled: true,
                bitmap: vec![0xFF], // too small for 16 events
            },
            ProviderUpdateRecord {
                provider_id: 2,
                is_enabled: true,
                bitmap: vec![0xFF, 0, 0, 0],
            },
        ]);

        assert!(matches!(
            server.apply_updates(&block),
            Err(ApplyUpdatesError::Update(_))
        ));
        // The invalid record left its target untouched; the valid one landed.
        assert!(!bad.is_enabled());
        assert!(good.is_enabled());
    }

    #[test]
    fn test_apply_updates_malformed_block() {
        let server = EventServer::new(&PoolConfig::default());
        assert!(matches!(
            server.apply_updates(&[1, 2, 3]),
            Err(ApplyUpdatesError::Protocol(ProtocolError::Truncated))
        ));
    }

    // --- Session admission tests ---

    #[test]
    fn test_single_session_invariant() {
        let server = Arc::new(EventServer::new(&PoolConfig::default()));
        let blocks: Arc<dyn BlockStore> = Arc::new(InMemoryBlockStore::new());

        let (transport_a, _peer_a) = crate::transport::loopback_pair(4);
        let session = server
            .accept_session(transport_a, Arc::clone(&blocks))
            .unwrap();
        assert!(server.has_active_session());

        let (transport_b, _peer_b) = crate::transport::loopback_pair(4);
        assert!(matches!(
            server.accept_session(transport_b, Arc::clone(&blocks)),
            Err(AcceptError::SessionActive)
        ));

        // Terminating frees the slot for a new connection.
        drop(session);
        assert!(!server.has_active_session());
        let (transport_c, _peer_c) = crate::transport::loopback_pair(4);
        assert!(server.accept_session(transport_c, blocks).is_ok());
    }
}
