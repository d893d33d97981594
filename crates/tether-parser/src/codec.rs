//! Codec for encoding and decoding Tether packets.
//!
//! A single packet encodes to either a text string (type digit followed by
//! the payload) or, for binary payloads on channels that carry binary
//! frames, the raw bytes. Channels without binary support receive binary
//! payloads as `b` followed by standard base64.
//!
//! Long-polling batches several packets into one body separated by
//! [`RECORD_SEPARATOR`].

use base64::engine::general_purpose::STANDARD as Base64Standard;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

use crate::packet::{Packet, PacketData, PacketType};

/// Separator between packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

/// Prefix marking base64-encoded binary data in a text channel.
const BASE64_PREFIX: char = 'b';

/// Errors that can occur while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParserError {
    /// Nothing to decode.
    #[error("Empty packet")]
    Empty,

    /// The leading character is not a known packet type.
    #[error("Unknown packet type: {0:?}")]
    UnknownPacketType(char),

    /// Invalid base64 payload.
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Wire representation of one encoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    /// A text frame or text record.
    Text(String),
    /// A binary frame or binary record.
    Binary(Bytes),
}

impl RawData {
    /// Length in bytes, counting text as UTF-8.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            RawData::Text(text) => text.len(),
            RawData::Binary(data) => data.len(),
        }
    }

    /// Borrow the text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawData::Text(text) => Some(text),
            RawData::Binary(_) => None,
        }
    }

    /// Whether this is a binary payload.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, RawData::Binary(_))
    }
}

impl From<String> for RawData {
    fn from(s: String) -> Self {
        RawData::Text(s)
    }
}

impl From<&str> for RawData {
    fn from(s: &str) -> Self {
        RawData::Text(s.to_string())
    }
}

impl From<Bytes> for RawData {
    fn from(b: Bytes) -> Self {
        RawData::Binary(b)
    }
}

/// Encode a packet for the wire.
///
/// `supports_binary` says whether the channel can carry binary frames. When
/// it can't, binary payloads are base64-encoded into a text payload.
#[must_use]
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> RawData {
    match &packet.data {
        Some(PacketData::Binary(data)) if supports_binary => RawData::Binary(data.clone()),
        Some(PacketData::Binary(data)) => {
            let mut encoded = String::with_capacity(1 + data.len().div_ceil(3) * 4);
            encoded.push(BASE64_PREFIX);
            Base64Standard.encode_string(data, &mut encoded);
            RawData::Text(encoded)
        }
        Some(PacketData::Text(text)) => {
            let mut encoded = String::with_capacity(1 + text.len());
            encoded.push(packet.packet_type.as_char());
            encoded.push_str(text);
            RawData::Text(encoded)
        }
        None => RawData::Text(packet.packet_type.as_char().to_string()),
    }
}

/// Decode a packet received from the wire.
///
/// # Errors
///
/// Returns an error if the payload is empty, starts with an unknown packet
/// type, or carries invalid base64.
pub fn decode_packet(data: RawData) -> Result<Packet, ParserError> {
    let text = match data {
        RawData::Binary(bytes) => return Ok(Packet::message(bytes)),
        RawData::Text(text) => text,
    };

    let mut chars = text.chars();
    let first = chars.next().ok_or(ParserError::Empty)?;

    if first == BASE64_PREFIX {
        let decoded = Base64Standard.decode(chars.as_str())?;
        return Ok(Packet::message(decoded));
    }

    let packet_type = PacketType::try_from(first).map_err(ParserError::UnknownPacketType)?;
    let rest = chars.as_str();

    if rest.is_empty() {
        Ok(Packet::new(packet_type))
    } else {
        Ok(Packet::with_data(packet_type, rest))
    }
}

/// Encode a batch of packets into a single polling payload.
#[must_use]
pub fn encode_payload(packets: &[Packet]) -> String {
    let mut payload = String::new();

    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            payload.push(RECORD_SEPARATOR);
        }
        match encode_packet(packet, false) {
            RawData::Text(text) => payload.push_str(&text),
            RawData::Binary(_) => unreachable!("binary is base64-encoded without binary support"),
        }
    }

    payload
}

/// Decode a polling payload into its packets.
///
/// # Errors
///
/// Returns the first decoding error; packets before it are discarded.
pub fn decode_payload(payload: &str) -> Result<Vec<Packet>, ParserError> {
    payload
        .split(RECORD_SEPARATOR)
        .map(|record| decode_packet(RawData::Text(record.to_string())))
        .collect()
}
