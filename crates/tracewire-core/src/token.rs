//! Event token codec.
//!
//! Events are packed back-to-back inside chunks as variable-length tokens.
//! Every token starts with a one-byte header: the low nibble carries the
//! token kind, the high nibble carries a small timestamp delta (meaningful
//! only on data tokens). The body layout depends on the kind:
//!
//! ```text
//! Provider  : id u32 | padding u32 | frequency u64 | timestamp u64   (24 B)
//! Data      : event id u32 | event index u32 | payload size u64      (16 B)
//!             followed by `payload size` payload bytes
//! Timestamp : frequency u64 | timestamp u64                          (16 B)
//! TimeDelta : num_bytes u8                                           ( 1 B)
//!             followed by `num_bytes` little-endian delta bytes (<= 6)
//! ```
//!
//! All integers are little-endian. A provider's stream always opens with a
//! Provider token carrying a full timestamp; every data token is preceded
//! (in stream order) by timestamp information — the inline small delta, a
//! TimeDelta token, or a full Timestamp/Provider token.
//!
//! Two decoders are provided: [`decode_stream`] parses a complete byte run,
//! and [`StreamDecoder`] incrementally reassembles tokens from arbitrary
//! fragments (network packets) while reconstructing absolute event
//! timestamps.

use std::collections::VecDeque;

/// Size of the one-byte token header.
pub const TOKEN_HEADER_SIZE: usize = 1;

/// Body size of a provider token.
pub const PROVIDER_TOKEN_SIZE: usize = 24;

/// Body size of a data token (excluding its payload).
pub const DATA_TOKEN_SIZE: usize = 16;

/// Body size of a timestamp token.
pub const TIMESTAMP_TOKEN_SIZE: usize = 16;

/// Fixed body size of a time-delta token (excluding its delta bytes).
pub const TIME_DELTA_TOKEN_SIZE: usize = 1;

/// Maximum number of bytes used to encode a time delta.
pub const MAX_TIME_DELTA_BYTES: usize = 6;

/// Largest timestamp delta that fits in the header's small-delta nibble.
pub const MAX_SMALL_DELTA: u64 = 0xF;

/// Maximum number of bytes any single token occupies (header + largest body).
pub const MAX_TOKEN_SIZE: usize = TOKEN_HEADER_SIZE + PROVIDER_TOKEN_SIZE;

// ---------------------------------------------------------------------------
// TokenKind
// ---------------------------------------------------------------------------

/// Token kind discriminants carried in the header's low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    /// Marks the start of a provider's stream.
    Provider = 0,
    /// Wraps one event's payload.
    Data = 1,
    /// Full timestamp (frequency + absolute value).
    Timestamp = 2,
    /// Variable-width delta from the previous timestamp.
    TimeDelta = 3,
}

impl TokenKind {
    /// Converts a header nibble to a [`TokenKind`], if valid.
    #[must_use]
    pub fn from_nibble(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Provider),
            1 => Some(Self::Data),
            2 => Some(Self::Timestamp),
            3 => Some(Self::TimeDelta),
            _ => None,
        }
    }

    /// Returns the fixed body size for this kind, excluding the header and
    /// any variable-length tail (data payload, delta bytes).
    #[must_use]
    pub fn body_size(self) -> usize {
        match self {
            Self::Provider => PROVIDER_TOKEN_SIZE,
            Self::Data => DATA_TOKEN_SIZE,
            Self::Timestamp => TIMESTAMP_TOKEN_SIZE,
            Self::TimeDelta => TIME_DELTA_TOKEN_SIZE,
        }
    }
}

/// Packs a token header byte: kind in the low nibble, small delta in the
/// high nibble.
#[inline]
#[must_use]
pub fn pack_header(kind: TokenKind, small_delta: u8) -> u8 {
    debug_assert!(small_delta <= MAX_SMALL_DELTA as u8);
    (kind as u8) | (small_delta << 4)
}

/// Splits a token header byte into its (kind nibble, small delta) parts.
#[inline]
#[must_use]
pub fn unpack_header(header: u8) -> (u8, u8) {
    (header & 0x0F, header >> 4)
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A decoded event token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Start of a provider's stream.
    Provider {
        /// Provider identifier.
        provider_id: u32,
        /// Tick frequency of `timestamp`.
        frequency: u64,
        /// Absolute timestamp at stream start.
        timestamp: u64,
    },
    /// One event's payload.
    Data {
        /// Small timestamp delta from the header nibble.
        small_delta: u8,
        /// Event identifier within the provider.
        event_id: u32,
        /// Monotonic per-provider event index. Gaps indicate dropped events.
        event_index: u32,
        /// Event payload bytes.
        payload: Vec<u8>,
    },
    /// Full timestamp resynchronization point.
    Timestamp {
        /// Tick frequency of `timestamp`.
        frequency: u64,
        /// Absolute timestamp.
        timestamp: u64,
    },
    /// Delta from the previous timestamp in the stream.
    TimeDelta {
        /// Delta value in ticks.
        delta: u64,
        /// Number of bytes the delta was encoded with (1..=6).
        num_bytes: u8,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error produced while decoding a token stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The header's kind nibble is not a known token kind.
    #[error("unknown token kind {0:#x}")]
    UnknownKind(u8),

    /// A time-delta token declared an invalid byte width.
    #[error("invalid time delta width {0} (expected 1..=6)")]
    InvalidDeltaWidth(u8),

    /// The byte run ended in the middle of a token.
    #[error("truncated token stream")]
    Truncated,
}

// ---------------------------------------------------------------------------
// Slice decoding
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

fn read_delta(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        value |= u64::from(*b) << (i * 8);
    }
    value
}

/// Decodes a single token from the front of `buf`.
///
/// Returns the token and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] if `buf` ends mid-token, or a
/// malformed-header error for unknown kinds / invalid delta widths.
pub fn decode_one(buf: &[u8]) -> Result<(Token, usize), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let (kind_bits, small_delta) = unpack_header(buf[0]);
    let kind = TokenKind::from_nibble(kind_bits).ok_or(DecodeError::UnknownKind(kind_bits))?;

    let body_start = TOKEN_HEADER_SIZE;
    let body_end = body_start + kind.body_size();
    if buf.len() < body_end {
        return Err(DecodeError::Truncated);
    }
    let body = &buf[body_start..body_end];

    match kind {
        TokenKind::Provider => Ok((
            Token::Provider {
                provider_id: read_u32(&body[0..4]),
                frequency: read_u64(&body[8..16]),
                timestamp: read_u64(&body[16..24]),
            },
            body_end,
        )),
        TokenKind::Timestamp => Ok((
            Token::Timestamp {
                frequency: read_u64(&body[0..8]),
                timestamp: read_u64(&body[8..16]),
            },
            body_end,
        )),
        TokenKind::Data => {
            let payload_size = read_u64(&body[8..16]);
            let payload_size = usize::try_from(payload_size).map_err(|_| DecodeError::Truncated)?;
            let payload_end = body_end + payload_size;
            if buf.len() < payload_end {
                return Err(DecodeError::Truncated);
            }
            Ok((
                Token::Data {
                    small_delta,
                    event_id: read_u32(&body[0..4]),
                    event_index: read_u32(&body[4..8]),
                    payload: buf[body_end..payload_end].to_vec(),
                },
                payload_end,
            ))
        }
        TokenKind::TimeDelta => {
            let num_bytes = body[0];
            if num_bytes == 0 || num_bytes as usize > MAX_TIME_DELTA_BYTES {
                return Err(DecodeError::InvalidDeltaWidth(num_bytes));
            }
            let delta_end = body_end + num_bytes as usize;
            if buf.len() < delta_end {
                return Err(DecodeError::Truncated);
            }
            Ok((
                Token::TimeDelta {
                    delta: read_delta(&buf[body_end..delta_end]),
                    num_bytes,
                },
                delta_end,
            ))
        }
    }
}

/// Decodes a complete byte run into its token sequence.
///
/// The run must consist of whole tokens; a trailing partial token is an
/// error.
///
/// # Errors
///
/// Returns the first decode error encountered.
pub fn decode_stream(mut buf: &[u8]) -> Result<Vec<Token>, DecodeError> {
    let mut tokens = Vec::new();
    while !buf.is_empty() {
        let (token, consumed) = decode_one(buf)?;
        tokens.push(token);
        buf = &buf[consumed..];
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Incremental decoding
// ---------------------------------------------------------------------------

/// An item recovered from a provider's token stream.
///
/// Timestamp and time-delta tokens are absorbed into the running clock; only
/// stream starts and events surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A provider opened a new stream.
    StreamStart {
        /// Provider identifier.
        provider_id: u32,
        /// Tick frequency for all timestamps that follow.
        frequency: u64,
        /// Absolute timestamp at stream start.
        timestamp: u64,
    },
    /// One event, with its absolute timestamp reconstructed.
    Event {
        /// Event identifier within the provider.
        event_id: u32,
        /// Monotonic per-provider event index.
        event_index: u32,
        /// Reconstructed absolute timestamp in ticks.
        timestamp: u64,
        /// Event payload bytes.
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the one-byte token header.
    Header,
    /// Accumulating the fixed-size token body.
    Body,
    /// Accumulating the variable-length tail (data payload or delta bytes).
    Tail { len: usize },
}

/// Incremental token-stream decoder.
///
/// Feed it byte fragments in arrival order (network packets may split a
/// token anywhere, including inside the header's body) and drain completed
/// [`StreamItem`]s. The decoder tracks the running timestamp so each event
/// carries its exact absolute time.
#[derive(Debug)]
pub struct StreamDecoder {
    state: DecodeState,
    /// Bytes of the token currently being assembled.
    buf: Vec<u8>,
    items: VecDeque<StreamItem>,
    frequency: u64,
    time: u64,
}

impl StreamDecoder {
    /// Creates an idle decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            buf: Vec::with_capacity(MAX_TOKEN_SIZE),
            items: VecDeque::new(),
            frequency: 0,
            time: 0,
        }
    }

    /// Returns `true` when no partial token is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Header && self.buf.is_empty()
    }

    /// Pops the next completed stream item, if any.
    pub fn next_item(&mut self) -> Option<StreamItem> {
        self.items.pop_front()
    }

    /// Feeds a fragment of stream bytes into the decoder.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on a malformed header; the decoder is not
    /// usable afterwards (the stream position is lost).
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<(), DecodeError> {
        while !bytes.is_empty() {
            match self.state {
                DecodeState::Header => {
                    let (kind_bits, _) = unpack_header(bytes[0]);
                    TokenKind::from_nibble(kind_bits)
                        .ok_or(DecodeError::UnknownKind(kind_bits))?;
                    self.buf.push(bytes[0]);
                    bytes = &bytes[1..];
                    self.state = DecodeState::Body;
                }
                DecodeState::Body => {
                    let kind = self.current_kind();
                    let needed = TOKEN_HEADER_SIZE + kind.body_size() - self.buf.len();
                    let take = needed.min(bytes.len());
                    self.buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if take == needed {
                        match self.tail_len()? {
                            0 => self.complete_token(),
                            len => self.state = DecodeState::Tail { len },
                        }
                    }
                }
                DecodeState::Tail { len } => {
                    let kind = self.current_kind();
                    let total = TOKEN_HEADER_SIZE + kind.body_size() + len;
                    let needed = total - self.buf.len();
                    let take = needed.min(bytes.len());
                    self.buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if take == needed {
                        self.complete_token();
                    }
                }
            }
        }
        Ok(())
    }

    fn current_kind(&self) -> TokenKind {
        let (kind_bits, _) = unpack_header(self.buf[0]);
        // The header nibble was validated on entry.
        TokenKind::from_nibble(kind_bits).unwrap_or(TokenKind::Provider)
    }

    /// Length of the variable tail for the fully buffered fixed part.
    fn tail_len(&self) -> Result<usize, DecodeError> {
        let body = &self.buf[TOKEN_HEADER_SIZE..];
        match self.current_kind() {
            TokenKind::Provider | TokenKind::Timestamp => Ok(0),
            TokenKind::Data => {
                let size = read_u64(&body[8..16]);
                usize::try_from(size).map_err(|_| DecodeError::Truncated)
            }
            TokenKind::TimeDelta => {
                let num_bytes = body[0];
                if num_bytes == 0 || num_bytes as usize > MAX_TIME_DELTA_BYTES {
                    return Err(DecodeError::InvalidDeltaWidth(num_bytes));
                }
                Ok(num_bytes as usize)
            }
        }
    }

    fn complete_token(&mut self) {
        let (_, small_delta) = unpack_header(self.buf[0]);
        let body = &self.buf[TOKEN_HEADER_SIZE..];
        match self.current_kind() {
            TokenKind::Provider => {
                self.frequency = read_u64(&body[8..16]);
                self.time = read_u64(&body[16..24]);
                self.items.push_back(StreamItem::StreamStart {
                    provider_id: read_u32(&body[0..4]),
                    frequency: self.frequency,
                    timestamp: self.time,
                });
            }
            TokenKind::Timestamp => {
                self.frequency = read_u64(&body[0..8]);
                self.time = read_u64(&body[8..16]);
            }
            TokenKind::TimeDelta => {
                let num_bytes = body[0] as usize;
                let delta = read_delta(&body[TIME_DELTA_TOKEN_SIZE..TIME_DELTA_TOKEN_SIZE + num_bytes]);
                self.time = self.time.wrapping_add(delta);
            }
            TokenKind::Data => {
                self.time = self.time.wrapping_add(u64::from(small_delta));
                self.items.push_back(StreamItem::Event {
                    event_id: read_u32(&body[0..4]),
                    event_index: read_u32(&body[4..8]),
                    timestamp: self.time,
                    payload: body[DATA_TOKEN_SIZE..].to_vec(),
                });
            }
        }
        self.buf.clear();
        self.state = DecodeState::Header;
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_token(provider_id: u32, frequency: u64, timestamp: u64) -> Vec<u8> {
        let mut bytes = vec![pack_header(TokenKind::Provider, 0)];
        bytes.extend_from_slice(&provider_id.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&frequency.to_le_bytes());
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes
    }

    fn data_token(small_delta: u8, event_id: u32, index: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![pack_header(TokenKind::Data, small_delta)];
        bytes.extend_from_slice(&event_id.to_le_bytes());
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn time_delta_token(delta: u64, num_bytes: u8) -> Vec<u8> {
        let mut bytes = vec![pack_header(TokenKind::TimeDelta, 0), num_bytes];
        bytes.extend_from_slice(&delta.to_le_bytes()[..num_bytes as usize]);
        bytes
    }

    // --- Header tests ---

    #[test]
    fn test_header_packing() {
        let header = pack_header(TokenKind::Data, 0xB);
        assert_eq!(header, 0xB1);
        assert_eq!(unpack_header(header), (1, 0xB));
    }

    #[test]
    fn test_kind_from_nibble() {
        assert_eq!(TokenKind::from_nibble(0), Some(TokenKind::Provider));
        assert_eq!(TokenKind::from_nibble(3), Some(TokenKind::TimeDelta));
        assert_eq!(TokenKind::from_nibble(4), None);
        assert_eq!(TokenKind::from_nibble(0xF), None);
    }

    // --- Slice decoding tests ---

    #[test]
    fn test_decode_stream() {
        let mut stream = provider_token(0x1001, 1_000_000_000, 5000);
        stream.extend(data_token(2, 7, 0, &[0xAA, 0xBB]));
        stream.extend(time_delta_token(300, 2));
        stream.extend(data_token(0, 8, 1, &[]));

        let tokens = decode_stream(&stream).unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(
            tokens[0],
            Token::Provider {
                provider_id: 0x1001,
                frequency: 1_000_000_000,
                timestamp: 5000,
            }
        );
        assert_eq!(
            tokens[1],
            Token::Data {
                small_delta: 2,
                event_id: 7,
                event_index: 0,
                payload: vec![0xAA, 0xBB],
            }
        );
        assert_eq!(
            tokens[2],
            Token::TimeDelta {
                delta: 300,
                num_bytes: 2,
            }
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert_eq!(decode_stream(&[0x07]), Err(DecodeError::UnknownKind(7)));
    }

    #[test]
    fn test_decode_truncated_body() {
        let stream = &provider_token(1, 1, 1)[..10];
        assert_eq!(decode_stream(stream), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut stream = data_token(0, 1, 0, &[1, 2, 3]);
        stream.pop();
        assert_eq!(decode_stream(&stream), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_invalid_delta_width() {
        let stream = [pack_header(TokenKind::TimeDelta, 0), 7, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_stream(&stream), Err(DecodeError::InvalidDeltaWidth(7)));

        let stream = [pack_header(TokenKind::TimeDelta, 0), 0];
        assert_eq!(decode_stream(&stream), Err(DecodeError::InvalidDeltaWidth(0)));
    }

    // --- Incremental decoding tests ---

    #[test]
    fn test_incremental_matches_whole_stream() {
        let mut stream = provider_token(42, 1000, 100);
        stream.extend(data_token(5, 1, 0, b"hello"));
        stream.extend(time_delta_token(0x1234, 2));
        stream.extend(data_token(0, 2, 1, b"world"));

        // Feed one byte at a time; every split point is exercised.
        let mut decoder = StreamDecoder::new();
        for byte in &stream {
            decoder.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert!(decoder.is_idle());

        assert_eq!(
            decoder.next_item(),
            Some(StreamItem::StreamStart {
                provider_id: 42,
                frequency: 1000,
                timestamp: 100,
            })
        );
        assert_eq!(
            decoder.next_item(),
            Some(StreamItem::Event {
                event_id: 1,
                event_index: 0,
                timestamp: 105,
                payload: b"hello".to_vec(),
            })
        );
        assert_eq!(
            decoder.next_item(),
            Some(StreamItem::Event {
                event_id: 2,
                event_index: 1,
                timestamp: 105 + 0x1234,
                payload: b"world".to_vec(),
            })
        );
        assert_eq!(decoder.next_item(), None);
    }

    #[test]
    fn test_incremental_timestamp_resync() {
        let mut decoder = StreamDecoder::new();
        let mut stream = provider_token(1, 1000, 100);
        // Full timestamp token rebases the running clock.
        stream.push(pack_header(TokenKind::Timestamp, 0));
        stream.extend_from_slice(&2000u64.to_le_bytes());
        stream.extend_from_slice(&9999u64.to_le_bytes());
        stream.extend(data_token(1, 3, 0, &[]));

        decoder.feed(&stream).unwrap();
        let _ = decoder.next_item();
        assert_eq!(
            decoder.next_item(),
            Some(StreamItem::Event {
                event_id: 3,
                event_index: 0,
                timestamp: 10000,
                payload: Vec::new(),
            })
        );
    }

    #[test]
    fn test_incremental_rejects_bad_header() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(&[0x0F]), Err(DecodeError::UnknownKind(0xF)));
    }

    #[test]
    fn test_decoder_idle_tracking() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.is_idle());
        let stream = data_token(0, 1, 0, &[1, 2, 3]);
        decoder.feed(&stream[..4]).unwrap();
        assert!(!decoder.is_idle());
        decoder.feed(&stream[4..]).unwrap();
        assert!(decoder.is_idle());
    }
}
