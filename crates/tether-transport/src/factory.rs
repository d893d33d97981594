//! Transport selection.
//!
//! Maps a transport name to the constructor that builds it for an incoming
//! request. The polling entry is not a single type: the request's `j` query
//! parameter decides, per request, between plain and JSONP polling.

use std::fmt;
use std::str::FromStr;

use tether_parser::Packet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::polling::{JsonpPollingTransport, PollingTransport};
use crate::request::{TransportRequest, JSONP_PARAM};
use crate::traits::{
    CloseCallback, ReadyState, Transport, TransportBase, TransportError, TransportEvent,
};
use crate::webtransport::WebTransportTransport;
use crate::websocket::{PerMessageDeflate, WebSocketTransport};

/// The transports a client can ask for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Polling,
    WebSocket,
    WebTransport,
}

impl TransportKind {
    /// Every registered transport.
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Polling,
        TransportKind::WebSocket,
        TransportKind::WebTransport,
    ];

    /// The name clients use for this transport.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
            TransportKind::WebTransport => "webtransport",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::WebSocket),
            "webtransport" => Ok(TransportKind::WebTransport),
            other => Err(TransportError::Configuration(format!(
                "unknown transport: {other}"
            ))),
        }
    }
}

/// A transport built by the factory.
#[derive(Debug)]
pub enum TransportVariant {
    Polling(PollingTransport),
    JsonpPolling(JsonpPollingTransport),
    WebSocket(WebSocketTransport),
    WebTransport(WebTransportTransport),
}

impl TransportVariant {
    /// Which registry entry built this transport.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportVariant::Polling(_) | TransportVariant::JsonpPolling(_) => TransportKind::Polling,
            TransportVariant::WebSocket(_) => TransportKind::WebSocket,
            TransportVariant::WebTransport(_) => TransportKind::WebTransport,
        }
    }

    /// Configure per-message compression. Only WebSocket transports compress;
    /// for the others this is a no-op.
    pub fn set_per_message_deflate(&mut self, deflate: Option<PerMessageDeflate>) {
        if let TransportVariant::WebSocket(ws) = self {
            ws.set_per_message_deflate(deflate);
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            TransportVariant::Polling(t) => t,
            TransportVariant::JsonpPolling(t) => t,
            TransportVariant::WebSocket(t) => t,
            TransportVariant::WebTransport(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transport {
        match self {
            TransportVariant::Polling(t) => t,
            TransportVariant::JsonpPolling(t) => t,
            TransportVariant::WebSocket(t) => t,
            TransportVariant::WebTransport(t) => t,
        }
    }
}

impl Transport for TransportVariant {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn handles_upgrades(&self) -> bool {
        self.inner().handles_upgrades()
    }

    fn supports_framing(&self) -> bool {
        self.inner().supports_framing()
    }

    fn send(&mut self, packets: Vec<Packet>) {
        self.inner_mut().send(packets);
    }

    fn do_close(&mut self, callback: Option<CloseCallback>) {
        self.inner_mut().do_close(callback);
    }

    fn base(&self) -> &TransportBase {
        self.inner().base()
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        self.inner_mut().base_mut()
    }

    fn writable(&self) -> bool {
        self.inner().writable()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner().ready_state()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner_mut().take_events()
    }
}

/// Builds a transport for a request.
pub type Constructor = fn(TransportRequest) -> Result<TransportVariant, TransportError>;

/// The constructor registered under `kind`.
#[must_use]
pub fn constructor(kind: TransportKind) -> Constructor {
    match kind {
        TransportKind::Polling => create_polling,
        TransportKind::WebSocket => create_websocket,
        TransportKind::WebTransport => create_webtransport,
    }
}

/// Build the transport `kind` for `request`.
///
/// # Errors
///
/// Propagates the constructor's error, e.g. a WebSocket request without an
/// upgraded socket.
pub fn create_transport(
    kind: TransportKind,
    request: TransportRequest,
) -> Result<TransportVariant, TransportError> {
    let transport = constructor(kind)(request)?;
    debug!(transport = %kind, "Transport created");
    Ok(transport)
}

/// Build a polling transport, JSONP if the request carries a `j` index.
///
/// # Errors
///
/// Propagates the constructor's error.
pub fn create_polling(request: TransportRequest) -> Result<TransportVariant, TransportError> {
    if request.query(JSONP_PARAM).is_some() {
        JsonpPollingTransport::new(request).map(TransportVariant::JsonpPolling)
    } else {
        PollingTransport::new(request).map(TransportVariant::Polling)
    }
}

fn create_websocket(request: TransportRequest) -> Result<TransportVariant, TransportError> {
    WebSocketTransport::new(request).map(TransportVariant::WebSocket)
}

fn create_webtransport(request: TransportRequest) -> Result<TransportVariant, TransportError> {
    WebTransportTransport::new(request).map(TransportVariant::WebTransport)
}

/// Transports a connection on `kind` may upgrade to, in order of preference.
#[must_use]
pub fn upgrades_for(kind: TransportKind) -> &'static [TransportKind] {
    match kind {
        TransportKind::Polling => &[TransportKind::WebSocket, TransportKind::WebTransport],
        TransportKind::WebSocket | TransportKind::WebTransport => &[],
    }
}

/// Upgrades for `kind` restricted to the transports the server enables.
#[must_use]
pub fn available_upgrades(kind: TransportKind, enabled: &[TransportKind]) -> Vec<TransportKind> {
    upgrades_for(kind)
        .iter()
        .copied()
        .filter(|upgrade| enabled.contains(upgrade))
        .collect()
}
