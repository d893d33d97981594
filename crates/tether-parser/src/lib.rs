//! # tether-parser
//!
//! Packet codec for the Tether realtime transport layer.
//!
//! Every transport speaks the same packet vocabulary: a single-digit type
//! followed by an optional payload. This crate turns [`Packet`]s into the
//! wire representation a transport writes ([`RawData`]) and back again.
//!
//! ## Packet Types
//!
//! - `open` / `close` - Session handshake and teardown
//! - `ping` / `pong` - Heartbeat
//! - `message` - Application data (text or binary)
//! - `upgrade` / `noop` - Transport upgrade coordination
//!
//! ## Example
//!
//! ```rust
//! use tether_parser::{decode_packet, encode_packet, Packet};
//!
//! let packet = Packet::message("hello");
//!
//! let encoded = encode_packet(&packet, true);
//! assert_eq!(encoded.as_text(), Some("4hello"));
//!
//! let decoded = decode_packet(encoded).unwrap();
//! assert_eq!(decoded, packet);
//! ```

pub mod codec;
pub mod packet;
pub mod version;

pub use codec::{
    decode_packet, decode_payload, encode_packet, encode_payload, ParserError, RawData,
    RECORD_SEPARATOR,
};
pub use packet::{Packet, PacketData, PacketOptions, PacketType, PreEncodedFrame};
pub use version::{Version, PROTOCOL_VERSION};
