//! Transport abstraction traits for Tether.
//!
//! Every concrete transport embeds a [`TransportBase`], which owns the
//! bookkeeping shared by all of them: the ready state, the `writable` flag,
//! and the event channel the upper protocol layer listens on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tether_parser::{decode_packet, Packet, ParserError, RawData};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Completion callback for a single outbound write.
pub type SendCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Callback invoked once a transport has been asked to close.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request lacks something a transport needs to be built.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The underlying channel failed to deliver a payload.
    #[error("{message}: {description}")]
    Write {
        /// Short summary.
        message: String,
        /// Underlying cause.
        description: String,
    },

    /// The underlying channel reported an error on its own.
    #[error("{message}: {description}")]
    Channel {
        /// Short summary.
        message: String,
        /// Underlying cause.
        description: String,
    },

    /// Inbound data could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParserError),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Open,
            1 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Notifications delivered to the upper protocol layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound packet.
    Packet(Packet),
    /// The last outbound batch was fully written; `send` may be called again.
    Drain,
    /// The transport closed. Delivered at most once.
    Close,
    /// The transport failed. Only the first error is delivered; later ones,
    /// and any raised after close, are logged at `warn` and dropped.
    Error(TransportError),
}

struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    ready_state: AtomicU8,
    writable: AtomicBool,
    closed: AtomicBool,
    errored: AtomicBool,
    supports_binary: bool,
}

/// Cloneable handle onto a transport's shared state.
///
/// Socket adapters and write callbacks hold one of these to report back into
/// the transport without borrowing it.
#[derive(Clone)]
pub struct BaseHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for BaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseHandle")
            .field("ready_state", &self.ready_state())
            .field("writable", &self.writable())
            .field("supports_binary", &self.shared.supports_binary)
            .finish()
    }
}

impl BaseHandle {
    /// Whether the transport accepts another outbound batch.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.shared.writable.load(Ordering::SeqCst)
    }

    /// Update the `writable` flag.
    pub fn set_writable(&self, writable: bool) {
        self.shared.writable.store(writable, Ordering::SeqCst);
    }

    /// Whether binary payloads may be sent as-is.
    #[must_use]
    pub fn supports_binary(&self) -> bool {
        self.shared.supports_binary
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.ready_state.load(Ordering::SeqCst))
    }

    /// Update the lifecycle state.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.shared.ready_state.store(state as u8, Ordering::SeqCst);
    }

    /// Handle raw inbound data: decode it and forward the packet.
    pub fn on_data(&self, data: RawData) {
        trace!(bytes = data.byte_len(), binary = data.is_binary(), "Inbound data");
        match decode_packet(data) {
            Ok(packet) => self.on_packet(packet),
            Err(e) => self.report(TransportError::Parse(e)),
        }
    }

    /// Forward an already-decoded inbound packet.
    pub fn on_packet(&self, packet: Packet) {
        self.emit(TransportEvent::Packet(packet));
    }

    /// Report a channel-level error.
    pub fn on_error(&self, message: impl Into<String>, description: impl Into<String>) {
        self.report(TransportError::Channel {
            message: message.into(),
            description: description.into(),
        });
    }

    /// Report a failed write.
    pub fn on_write_error(&self, message: impl Into<String>, description: impl Into<String>) {
        self.report(TransportError::Write {
            message: message.into(),
            description: description.into(),
        });
    }

    /// Completion callback for one write of a batch.
    ///
    /// A failure is reported as a write error. Success of the batch's last
    /// write makes the transport writable again and emits a drain.
    #[must_use]
    pub fn write_callback(&self, is_last: bool) -> SendCallback {
        let handle = self.clone();
        Box::new(move |result| match result {
            Err(e) => handle.on_write_error("write error", e.to_string()),
            Ok(()) if is_last => {
                trace!("Batch flushed");
                handle.on_drain();
            }
            Ok(()) => {}
        })
    }

    /// Mark the transport writable again and signal the upper layer.
    pub fn on_drain(&self) {
        self.set_writable(true);
        self.emit(TransportEvent::Drain);
    }

    /// Mark the transport closed. Only the first call has any effect.
    pub fn on_close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            trace!("Close already reported");
            return;
        }
        self.set_ready_state(ReadyState::Closed);
        self.emit(TransportEvent::Close);
    }

    pub(crate) fn report(&self, error: TransportError) {
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(error = %error, "Dropping error reported after close");
            return;
        }
        if self.shared.errored.swap(true, Ordering::SeqCst) {
            warn!(error = %error, "Dropping error, one was already reported");
            return;
        }
        self.emit(TransportEvent::Error(error));
    }

    fn emit(&self, event: TransportEvent) {
        if self.shared.events.send(event).is_err() {
            trace!("Transport event dropped, nobody is listening");
        }
    }
}

/// Bookkeeping shared by every transport.
#[derive(Debug)]
pub struct TransportBase {
    handle: BaseHandle,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl TransportBase {
    /// Create the base for a new, open transport. It starts out not writable.
    #[must_use]
    pub fn new(supports_binary: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            events: tx,
            ready_state: AtomicU8::new(ReadyState::Open as u8),
            writable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            supports_binary,
        };

        Self {
            handle: BaseHandle {
                shared: Arc::new(shared),
            },
            events: Some(rx),
        }
    }

    /// The shared handle.
    #[must_use]
    pub fn handle(&self) -> &BaseHandle {
        &self.handle
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }
}

/// The uniform interface every transport presents to the upper protocol layer.
///
/// Implementations are driven by a single owner: `send` must not be called
/// again until [`Transport::writable`] is true or a [`TransportEvent::Drain`]
/// has been received.
pub trait Transport: Send {
    /// Transport name (e.g., "polling", "websocket", "webtransport").
    fn name(&self) -> &'static str;

    /// Whether a connection on this transport may come from an upgrade.
    fn handles_upgrades(&self) -> bool;

    /// Whether the channel preserves message boundaries.
    fn supports_framing(&self) -> bool;

    /// Hand a batch of packets to the underlying channel, in order.
    fn send(&mut self, packets: Vec<Packet>);

    /// Close the underlying channel.
    fn do_close(&mut self, callback: Option<CloseCallback>);

    /// Shared bookkeeping.
    fn base(&self) -> &TransportBase;

    /// Shared bookkeeping, mutably.
    fn base_mut(&mut self) -> &mut TransportBase;

    /// Whether the transport accepts another outbound batch.
    fn writable(&self) -> bool {
        self.base().handle().writable()
    }

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState {
        self.base().handle().ready_state()
    }

    /// Take the event receiver. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.base_mut().take_events()
    }

    /// Close the transport unless it is already closing or closed.
    fn close(&mut self, callback: Option<CloseCallback>) {
        if self.ready_state() != ReadyState::Open {
            debug!(transport = self.name(), "Close ignored, already closing");
            return;
        }
        self.base().handle().set_ready_state(ReadyState::Closing);
        self.do_close(callback);
    }
}
