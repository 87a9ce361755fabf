//! # tracewire server
//!
//! The control plane of the tracewire telemetry pipeline: event providers
//! that serialize into pooled chunks, the provider registry, and the
//! per-connection session that interleaves a request/response control
//! protocol with best-effort streaming of buffered event data.
//!
//! ## Architecture
//!
//! ```text
//! producer threads                     session poll loop
//! ┌──────────────────┐    chunks    ┌──────────────────────┐
//! │ EventProvider    │  ─────────►  │ EventServerSession   │ ──► wire
//! │ (write, flush)   │   ChunkQueue │ (control + data push)│
//! └──────────────────┘              └──────────────────────┘
//!          ▲                                   │
//!          │ enable / disable / subscribe      │ discovery, updates
//!          └──────────── EventServer ◄─────────┘
//! ```
//!
//! Exactly one session may be active against a server at a time. Event loss
//! under memory pressure is by contract: dropped events surface as gaps in
//! the per-provider event index, never as partial tokens on the wire.

pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod transport;

pub use protocol::{ProtocolError, Request, Response, BlockId, MAX_EVENT_DATA_SIZE};
pub use provider::{EventProvider, ProviderConfig, UpdateError, WriteEventError};
pub use server::{AcceptError, EventServer, RegistryError, SessionId};
pub use session::{EventServerSession, SessionError};
pub use transport::{
    loopback_pair, BlockStore, InMemoryBlockStore, LoopbackTransport, Transport, TryRecvError,
    TrySendError,
};
