//! Packet types for the Tether protocol.
//!
//! A packet is the unit exchanged between the upper protocol layer and a
//! transport. Transports never look inside `data`; they only care about the
//! per-packet [`PacketOptions`] that steer how the packet is written.

use bytes::Bytes;

/// Packet type identifiers.
///
/// On the wire each type is a single ASCII digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketType {
    /// The ASCII digit used on the wire.
    #[must_use]
    pub fn as_char(self) -> char {
        char::from(b'0' + self as u8)
    }

    /// Lowercase name, as used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Open => "open",
            PacketType::Close => "close",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::Message => "message",
            PacketType::Upgrade => "upgrade",
            PacketType::Noop => "noop",
        }
    }
}

impl TryFrom<char> for PacketType {
    type Error = char;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            '0' => Ok(PacketType::Open),
            '1' => Ok(PacketType::Close),
            '2' => Ok(PacketType::Ping),
            '3' => Ok(PacketType::Pong),
            '4' => Ok(PacketType::Message),
            '5' => Ok(PacketType::Upgrade),
            '6' => Ok(PacketType::Noop),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData {
    /// UTF-8 text.
    Text(String),
    /// Opaque binary data.
    Binary(Bytes),
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        PacketData::Text(s)
    }
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        PacketData::Text(s.to_string())
    }
}

impl From<Bytes> for PacketData {
    fn from(b: Bytes) -> Self {
        PacketData::Binary(b)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        PacketData::Binary(Bytes::from(b))
    }
}

/// A message that has already been framed for a full-duplex socket.
///
/// The frame is always unfragmented and uncompressed, so it may only be
/// injected on a socket that has compression switched off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreEncodedFrame {
    /// Frame payload.
    pub payload: Bytes,
    /// Whether the frame carries binary (as opposed to text) data.
    pub binary: bool,
}

impl PreEncodedFrame {
    /// A text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            binary: false,
        }
    }

    /// A binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            binary: true,
        }
    }
}

/// Per-packet write options.
///
/// This is a plain value: each packet carries its own copy, and transports
/// derive a fresh set of socket options from it for every write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Advisory compression flag. A transport may override it.
    pub compress: Option<bool>,
    /// Pre-serialized wire text, sent verbatim instead of encoding the packet.
    pub ws_pre_encoded: Option<String>,
    /// Pre-built frame, injected directly when the socket allows it.
    pub ws_pre_encoded_frame: Option<PreEncodedFrame>,
}

impl PacketOptions {
    /// Set the advisory compression flag.
    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// Attach pre-serialized wire text.
    #[must_use]
    pub fn with_pre_encoded(mut self, encoded: impl Into<String>) -> Self {
        self.ws_pre_encoded = Some(encoded.into());
        self
    }

    /// Attach a pre-built frame.
    #[must_use]
    pub fn with_pre_encoded_frame(mut self, frame: PreEncodedFrame) -> Self {
        self.ws_pre_encoded_frame = Some(frame);
        self
    }
}

/// A protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub packet_type: PacketType,
    /// Optional payload.
    pub data: Option<PacketData>,
    /// Optional write options.
    pub options: Option<PacketOptions>,
}

impl Packet {
    /// Create a packet without data.
    #[must_use]
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            data: None,
            options: None,
        }
    }

    /// Create a packet carrying data.
    #[must_use]
    pub fn with_data(packet_type: PacketType, data: impl Into<PacketData>) -> Self {
        Self {
            packet_type,
            data: Some(data.into()),
            options: None,
        }
    }

    /// Create a new Message packet.
    #[must_use]
    pub fn message(data: impl Into<PacketData>) -> Self {
        Self::with_data(PacketType::Message, data)
    }

    /// Create a new Open packet carrying the handshake document.
    #[must_use]
    pub fn open(handshake: impl Into<String>) -> Self {
        Self::with_data(PacketType::Open, handshake.into())
    }

    /// Create a new Close packet.
    #[must_use]
    pub fn close() -> Self {
        Self::new(PacketType::Close)
    }

    /// Create a new Ping packet.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(PacketType::Ping)
    }

    /// Create a new Pong packet.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(PacketType::Pong)
    }

    /// Create a new Noop packet.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(PacketType::Noop)
    }

    /// Attach write options.
    #[must_use]
    pub fn with_options(mut self, options: PacketOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Whether the payload is binary.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self.data, Some(PacketData::Binary(_)))
    }
}
