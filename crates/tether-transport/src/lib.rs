//! # tether-transport
//!
//! Transport abstraction layer for the Tether realtime engine.
//!
//! This crate presents several network mechanisms behind one interface:
//!
//! - **Polling** - HTTP long-polling, plus a JSONP flavour for script-tag clients
//! - **WebSocket** - Full-duplex messages over an upgraded socket
//! - **WebTransport** - Length-prefixed records over a QUIC stream
//!
//! ## Transport Abstraction
//!
//! All transports implement the [`Transport`] trait. The upper protocol
//! layer picks one through the factory, then drives it with `send` and
//! listens for [`TransportEvent`]s.
//!
//! ```rust,ignore
//! use tether_transport::{create_transport, Transport, TransportEvent, TransportKind};
//!
//! let mut transport = create_transport(TransportKind::WebSocket, request)?;
//! let mut events = transport.take_events().unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         TransportEvent::Packet(packet) => { /* handle packet */ }
//!         TransportEvent::Drain => { /* flush queued packets */ }
//!         TransportEvent::Close | TransportEvent::Error(_) => break,
//!     }
//! }
//! ```

pub mod factory;
pub mod polling;
pub mod request;
pub mod socket;
pub mod traits;
pub mod webtransport;
pub mod websocket;

#[cfg(feature = "tungstenite")]
pub mod tungstenite_socket;

#[cfg(feature = "axum")]
pub mod axum_socket;

pub use factory::{
    available_upgrades, constructor, create_transport, upgrades_for, TransportKind,
    TransportVariant,
};
pub use polling::{JsonpPollingTransport, PollingTransport};
pub use request::TransportRequest;
pub use socket::{RawFrameSender, SendOptions, SocketAdapter, SocketEvent, SocketEventSink, StreamAdapter};
pub use traits::{
    BaseHandle, CloseCallback, ReadyState, SendCallback, Transport, TransportBase, TransportError,
    TransportEvent,
};
pub use webtransport::WebTransportTransport;
pub use websocket::{PerMessageDeflate, WebSocketTransport};

#[cfg(feature = "tungstenite")]
pub use tungstenite_socket::TungsteniteSocket;

#[cfg(feature = "axum")]
pub use axum_socket::AxumSocket;
