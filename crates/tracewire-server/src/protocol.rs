//! Control-plane wire protocol.
//!
//! Every control message is framed with a 4-byte little-endian header
//! `{ command: u8, reserved: u8, event_data_size: u16 }` followed by a
//! command-specific body. The `event_data_size` field is meaningful only on
//! [`Response::EventData`] packets, where it carries the byte count of the
//! streamed event data.
//!
//! Bulk payloads (the provider catalog and batched enablement updates) do
//! not travel in control messages; they move through out-of-band transfer
//! blocks whose record layouts are also defined here. Catalog consumers must
//! walk records via the computed per-record offsets, never fixed spacing.

use bytes::{Buf, BufMut};

/// Identifier of an out-of-band bulk transfer block.
pub type BlockId = u32;

/// Largest payload the underlying transport carries in one message
/// (a 1408-byte message minus its 24-byte transport header).
pub const MAX_TRANSPORT_PAYLOAD: usize = 1384;

/// Size of the control-message framing header.
pub const PAYLOAD_HEADER_SIZE: usize = 4;

/// Largest event-data slice carried by one [`Response::EventData`] packet.
pub const MAX_EVENT_DATA_SIZE: usize = MAX_TRANSPORT_PAYLOAD - PAYLOAD_HEADER_SIZE;

/// Token-encoding version advertised in catalog description headers.
/// Version 2 is the indexed-event encoding (64-bit payload sizes plus
/// per-event indices).
pub const ENCODING_VERSION: u8 = 2;

// ---------------------------------------------------------------------------
// Commands and result codes
// ---------------------------------------------------------------------------

/// Command codes carried in the framing header.
pub mod command {
    /// Provider discovery request.
    pub const QUERY_PROVIDERS_REQUEST: u8 = 1;
    /// Provider discovery response.
    pub const QUERY_PROVIDERS_RESPONSE: u8 = 2;
    /// Request to allocate (or reuse) the enablement-update block.
    pub const ALLOCATE_PROVIDER_UPDATES_REQUEST: u8 = 3;
    /// Response carrying the update block id.
    pub const ALLOCATE_PROVIDER_UPDATES_RESPONSE: u8 = 4;
    /// Request to apply the previously written update block.
    pub const APPLY_PROVIDER_UPDATES_REQUEST: u8 = 5;
    /// Result of applying provider updates.
    pub const APPLY_PROVIDER_UPDATES_RESPONSE: u8 = 6;
    /// Data-plane push of streamed event bytes.
    pub const EVENT_DATA_UPDATE: u8 = 7;
    /// Request to become the data sink of one provider.
    pub const SUBSCRIBE_TO_PROVIDER_REQUEST: u8 = 8;
    /// Result of a subscribe request.
    pub const SUBSCRIBE_TO_PROVIDER_RESPONSE: u8 = 9;
    /// Request to drop the current subscription. Carries no response.
    pub const UNSUBSCRIBE_FROM_PROVIDER_REQUEST: u8 = 10;
}

/// Wire result codes carried in response bodies.
pub mod wire_result {
    /// Operation succeeded.
    pub const SUCCESS: i32 = 0;
    /// Unspecified failure.
    pub const ERROR: i32 = 1;
    /// The referenced entity does not exist or is not reachable.
    pub const UNAVAILABLE: i32 = 2;
    /// The operation was refused by current state.
    pub const REJECTED: i32 = 3;
    /// Memory pressure prevented the operation.
    pub const INSUFFICIENT_MEMORY: i32 = 4;
    /// A request argument failed validation.
    pub const INVALID_PARAMETER: i32 = 5;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error produced while decoding a control message or block payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The command code is not part of the protocol.
    #[error("unknown command code {0}")]
    UnknownCommand(u8),

    /// The command code is valid but not legal in this direction.
    #[error("unexpected command code {0}")]
    UnexpectedCommand(u8),

    /// The message or block ended before its declared contents.
    #[error("truncated payload")]
    Truncated,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Client-to-server control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Snapshot the provider catalog into a transfer block.
    QueryProviders,
    /// Allocate (or reuse) a block the client will fill with enablement
    /// updates. `data_size` is the client's intended write size.
    AllocateProviderUpdates {
        /// Intended size of the update payload in bytes.
        data_size: u32,
    },
    /// Apply the updates previously written to the allocated block.
    ApplyProviderUpdates,
    /// Become the data sink for the given provider.
    SubscribeToProvider {
        /// Target provider id.
        provider_id: u32,
    },
    /// Drop the current subscription. No response is sent.
    UnsubscribeFromProvider,
}

impl Request {
    /// Encodes the request into a framed wire payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::QueryProviders => frame(command::QUERY_PROVIDERS_REQUEST, 0, |_| {}),
            Self::AllocateProviderUpdates { data_size } => {
                frame(command::ALLOCATE_PROVIDER_UPDATES_REQUEST, 0, |buf| {
                    buf.put_u32_le(*data_size);
                })
            }
            Self::ApplyProviderUpdates => frame(command::APPLY_PROVIDER_UPDATES_REQUEST, 0, |_| {}),
            Self::SubscribeToProvider { provider_id } => {
                frame(command::SUBSCRIBE_TO_PROVIDER_REQUEST, 0, |buf| {
                    buf.put_u32_le(*provider_id);
                })
            }
            Self::UnsubscribeFromProvider => {
                frame(command::UNSUBSCRIBE_FROM_PROVIDER_REQUEST, 0, |_| {})
            }
        }
    }

    /// Decodes a framed wire payload into a request.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unknown/misdirected commands or short
    /// payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (cmd, _, mut body) = split_frame(payload)?;
        match cmd {
            command::QUERY_PROVIDERS_REQUEST => Ok(Self::QueryProviders),
            command::ALLOCATE_PROVIDER_UPDATES_REQUEST => Ok(Self::AllocateProviderUpdates {
                data_size: take_u32(&mut body)?,
            }),
            command::APPLY_PROVIDER_UPDATES_REQUEST => Ok(Self::ApplyProviderUpdates),
            command::SUBSCRIBE_TO_PROVIDER_REQUEST => Ok(Self::SubscribeToProvider {
                provider_id: take_u32(&mut body)?,
            }),
            command::UNSUBSCRIBE_FROM_PROVIDER_REQUEST => Ok(Self::UnsubscribeFromProvider),
            command::QUERY_PROVIDERS_RESPONSE
            | command::ALLOCATE_PROVIDER_UPDATES_RESPONSE
            | command::APPLY_PROVIDER_UPDATES_RESPONSE
            | command::EVENT_DATA_UPDATE
            | command::SUBSCRIBE_TO_PROVIDER_RESPONSE => Err(ProtocolError::UnexpectedCommand(cmd)),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Server-to-client messages: control responses plus the data-plane push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Discovery result; the catalog is in block `block_id`.
    QueryProviders {
        /// Wire result code.
        result: i32,
        /// Transfer block holding the catalog.
        block_id: BlockId,
    },
    /// Update-block allocation result.
    AllocateProviderUpdates {
        /// Wire result code.
        result: i32,
        /// Transfer block the client writes updates into.
        block_id: BlockId,
    },
    /// Result of applying provider updates.
    ApplyProviderUpdates {
        /// Wire result code.
        result: i32,
    },
    /// Result of a subscribe request.
    SubscribeToProvider {
        /// Wire result code.
        result: i32,
    },
    /// A slice of streamed event data (receiver-driven push).
    EventData(Vec<u8>),
}

impl Response {
    /// Encodes the response into a framed wire payload.
    ///
    /// # Panics
    ///
    /// Debug-asserts that event data fits [`MAX_EVENT_DATA_SIZE`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::QueryProviders { result, block_id } => {
                frame(command::QUERY_PROVIDERS_RESPONSE, 0, |buf| {
                    buf.put_i32_le(*result);
                    buf.put_u32_le(*block_id);
                })
            }
            Self::AllocateProviderUpdates { result, block_id } => {
                frame(command::ALLOCATE_PROVIDER_UPDATES_RESPONSE, 0, |buf| {
                    buf.put_i32_le(*result);
                    buf.put_u32_le(*block_id);
                })
            }
            Self::ApplyProviderUpdates { result } => {
                frame(command::APPLY_PROVIDER_UPDATES_RESPONSE, 0, |buf| {
                    buf.put_i32_le(*result);
                })
            }
            Self::SubscribeToProvider { result } => {
                frame(command::SUBSCRIBE_TO_PROVIDER_RESPONSE, 0, |buf| {
                    buf.put_i32_le(*result);
                })
            }
            Self::EventData(data) => {
                debug_assert!(data.len() <= MAX_EVENT_DATA_SIZE);
                #[allow(clippy::cast_possible_truncation)]
                let size = data.len().min(MAX_EVENT_DATA_SIZE) as u16;
                frame(command::EVENT_DATA_UPDATE, size, |buf| {
                    buf.put_slice(&data[..size as usize]);
                })
            }
        }
    }

    /// Decodes a framed wire payload into a response.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unknown/misdirected commands or short
    /// payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (cmd, event_data_size, mut body) = split_frame(payload)?;
        match cmd {
            command::QUERY_PROVIDERS_RESPONSE => Ok(Self::QueryProviders {
                result: take_i32(&mut body)?,
                block_id: take_u32(&mut body)?,
            }),
            command::ALLOCATE_PROVIDER_UPDATES_RESPONSE => Ok(Self::AllocateProviderUpdates {
                result: take_i32(&mut body)?,
                block_id: take_u32(&mut body)?,
            }),
            command::APPLY_PROVIDER_UPDATES_RESPONSE => Ok(Self::ApplyProviderUpdates {
                result: take_i32(&mut body)?,
            }),
            command::SUBSCRIBE_TO_PROVIDER_RESPONSE => Ok(Self::SubscribeToProvider {
                result: take_i32(&mut body)?,
            }),
            command::EVENT_DATA_UPDATE => {
                let size = event_data_size as usize;
                if body.len() < size {
                    return Err(ProtocolError::Truncated);
                }
                Ok(Self::EventData(body[..size].to_vec()))
            }
            command::QUERY_PROVIDERS_REQUEST
            | command::ALLOCATE_PROVIDER_UPDATES_REQUEST
            | command::APPLY_PROVIDER_UPDATES_REQUEST
            | command::SUBSCRIBE_TO_PROVIDER_REQUEST
            | command::UNSUBSCRIBE_FROM_PROVIDER_REQUEST => {
                Err(ProtocolError::UnexpectedCommand(cmd))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

fn frame(cmd: u8, event_data_size: u16, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PAYLOAD_HEADER_SIZE + 8);
    buf.put_u8(cmd);
    buf.put_u8(0);
    buf.put_u16_le(event_data_size);
    body(&mut buf);
    buf
}

fn split_frame(payload: &[u8]) -> Result<(u8, u16, &[u8]), ProtocolError> {
    if payload.len() < PAYLOAD_HEADER_SIZE {
        return Err(ProtocolError::Truncated);
    }
    let cmd = payload[0];
    let event_data_size = u16::from_le_bytes([payload[2], payload[3]]);
    Ok((cmd, event_data_size, &payload[PAYLOAD_HEADER_SIZE..]))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_i32_le())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Bulk block layouts
// ---------------------------------------------------------------------------

/// Number of bytes in a provider's enablement bitmap: one bit per event,
/// rounded up to a 32-bit boundary.
#[must_use]
pub fn bitmap_bytes(num_events: u32) -> usize {
    (num_events.div_ceil(32) * 4) as usize
}

/// One provider's record in the discovery catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCatalogEntry {
    /// Provider identifier.
    pub provider_id: u32,
    /// Number of events the provider declares.
    pub num_events: u32,
    /// Whether the provider is currently enabled.
    pub is_enabled: bool,
    /// Token-encoding version of the server (see [`ENCODING_VERSION`]).
    pub version: u8,
    /// Per-event enablement bits, `bitmap_bytes(num_events)` long.
    pub bitmap: Vec<u8>,
    /// Opaque per-event description bytes.
    pub description: Vec<u8>,
}

/// Serializes the discovery catalog into transfer-block bytes.
///
/// Layout per provider: a 16-byte description header
/// `{ provider_id u32, num_events u32, description_size u32, is_enabled u8,
/// version u8, padding [u8; 2] }`, then the enablement bitmap, then the
/// description bytes. A u32 provider count leads the block.
#[must_use]
pub fn encode_catalog(entries: &[ProviderCatalogEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        debug_assert_eq!(entry.bitmap.len(), bitmap_bytes(entry.num_events));
        buf.put_u32_le(entry.provider_id);
        buf.put_u32_le(entry.num_events);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(entry.description.len() as u32);
        buf.put_u8(u8::from(entry.is_enabled));
        buf.put_u8(entry.version);
        buf.put_slice(&[0u8; 2]);
        buf.put_slice(&entry.bitmap);
        buf.put_slice(&entry.description);
    }
    buf
}

/// Parses a discovery catalog from transfer-block bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] if the block ends mid-record.
pub fn decode_catalog(mut buf: &[u8]) -> Result<Vec<ProviderCatalogEntry>, ProtocolError> {
    let count = take_u32(&mut buf)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let provider_id = take_u32(&mut buf)?;
        let num_events = take_u32(&mut buf)?;
        let description_size = take_u32(&mut buf)?;
        let is_enabled = take_u8(&mut buf)? != 0;
        let version = take_u8(&mut buf)?;
        let _padding = take_bytes(&mut buf, 2)?;
        let bitmap = take_bytes(&mut buf, bitmap_bytes(num_events))?;
        let description = take_bytes(&mut buf, description_size as usize)?;
        entries.push(ProviderCatalogEntry {
            provider_id,
            num_events,
            is_enabled,
            version,
            bitmap,
            description,
        });
    }
    Ok(entries)
}

/// One provider's record in an enablement-update block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUpdateRecord {
    /// Target provider id. Unknown ids are skipped by the server.
    pub provider_id: u32,
    /// New provider enablement flag.
    pub is_enabled: bool,
    /// New per-event enablement bits. Must cover the provider's declared
    /// event count.
    pub bitmap: Vec<u8>,
}

/// Serializes enablement updates into transfer-block bytes.
///
/// Layout per record: a 12-byte header `{ provider_id u32, bitmap_size u32,
/// is_enabled u8, padding [u8; 3] }` followed by `bitmap_size` bitmap bytes.
#[must_use]
pub fn encode_updates(records: &[ProviderUpdateRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        buf.put_u32_le(record.provider_id);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(record.bitmap.len() as u32);
        buf.put_u8(u8::from(record.is_enabled));
        buf.put_slice(&[0u8; 3]);
        buf.put_slice(&record.bitmap);
    }
    buf
}

/// Parses enablement updates from transfer-block bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] if the block ends mid-record.
pub fn decode_updates(mut buf: &[u8]) -> Result<Vec<ProviderUpdateRecord>, ProtocolError> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        let provider_id = take_u32(&mut buf)?;
        let bitmap_size = take_u32(&mut buf)?;
        let is_enabled = take_u8(&mut buf)? != 0;
        let _padding = take_bytes(&mut buf, 3)?;
        let bitmap = take_bytes(&mut buf, bitmap_size as usize)?;
        records.push(ProviderUpdateRecord {
            provider_id,
            is_enabled,
            bitmap,
        });
    }
    Ok(records)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // --- Framing tests ---

    #[test]
    fn test_request_frame_layout() {
        let bytes = Request::SubscribeToProvider { provider_id: 0x1001 }.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], command::SUBSCRIBE_TO_PROVIDER_REQUEST);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(&bytes[4..8], &0x1001u32.to_le_bytes());

        assert_eq!(
            Request::decode(&bytes),
            Ok(Request::SubscribeToProvider { provider_id: 0x1001 })
        );
    }

    #[test]
    fn test_event_data_size_travels_in_header() {
        let bytes = Response::EventData(vec![9, 8, 7]).encode();
        assert_eq!(bytes[0], command::EVENT_DATA_UPDATE);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 3);
        assert_eq!(
            Response::decode(&bytes),
            Ok(Response::EventData(vec![9, 8, 7]))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let bytes = [99, 0, 0, 0];
        assert_eq!(Request::decode(&bytes), Err(ProtocolError::UnknownCommand(99)));
    }

    #[test]
    fn test_decode_rejects_misdirected_command() {
        // A response command arriving on the server's receive path.
        let bytes = Response::ApplyProviderUpdates { result: 0 }.encode();
        assert_eq!(
            Request::decode(&bytes),
            Err(ProtocolError::UnexpectedCommand(
                command::APPLY_PROVIDER_UPDATES_RESPONSE
            ))
        );
    }

    #[test]
    fn test_decode_short_payloads() {
        assert_eq!(Request::decode(&[1, 0]), Err(ProtocolError::Truncated));
        // Allocate request missing its u32 body.
        let bytes = [command::ALLOCATE_PROVIDER_UPDATES_REQUEST, 0, 0, 0];
        assert_eq!(Request::decode(&bytes), Err(ProtocolError::Truncated));
    }

    // --- Bitmap sizing tests ---

    #[test]
    fn test_bitmap_rounds_to_word_boundary() {
        assert_eq!(bitmap_bytes(0), 0);
        assert_eq!(bitmap_bytes(1), 4);
        assert_eq!(bitmap_bytes(8), 4);
        assert_eq!(bitmap_bytes(32), 4);
        assert_eq!(bitmap_bytes(33), 8);
        assert_eq!(bitmap_bytes(64), 8);
    }

    // --- Catalog tests ---

    #[test]
    fn test_catalog_offset_walking() {
        // Two providers with different bitmap and description sizes; the
        // decoder must stride by computed offsets.
        let entries = vec![
            ProviderCatalogEntry {
                provider_id: 0x1001,
                num_events: 8,
                is_enabled: true,
                version: ENCODING_VERSION,
                bitmap: vec![0xFF, 0, 0, 0],
                description: b"gpu memory events".to_vec(),
            },
            ProviderCatalogEntry {
                provider_id: 0x2002,
                num_events: 40,
                is_enabled: false,
                version: ENCODING_VERSION,
                bitmap: vec![0; 8],
                description: Vec::new(),
            },
        ];

        let block = encode_catalog(&entries);
        assert_eq!(decode_catalog(&block), Ok(entries));
    }

    #[test]
    fn test_catalog_truncated_record() {
        let entries = vec![ProviderCatalogEntry {
            provider_id: 1,
            num_events: 8,
            is_enabled: true,
            version: ENCODING_VERSION,
            bitmap: vec![1, 0, 0, 0],
            description: vec![0xAB; 10],
        }];
        let mut block = encode_catalog(&entries);
        block.truncate(block.len() - 1);
        assert_eq!(decode_catalog(&block), Err(ProtocolError::Truncated));
    }

    // --- Update block tests ---

    #[test]
    fn test_update_records() {
        let records = vec![
            ProviderUpdateRecord {
                provider_id: 7,
                is_enabled: true,
                bitmap: vec![0x0F, 0, 0, 0],
            },
            ProviderUpdateRecord {
                provider_id: 8,
                is_enabled: false,
                bitmap: Vec::new(),
            },
        ];
        let block = encode_updates(&records);
        assert_eq!(decode_updates(&block), Ok(records));
    }

    #[test]
    fn test_update_truncated_bitmap() {
        let block = encode_updates(&[ProviderUpdateRecord {
            provider_id: 7,
            is_enabled: true,
            bitmap: vec![1, 2, 3, 4],
        }]);
        assert_eq!(decode_updates(&block[..block.len() - 2]), Err(ProtocolError::Truncated));
    }
}
