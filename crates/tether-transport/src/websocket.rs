//! WebSocket transport implementation.
//!
//! Wraps an already-upgraded [`SocketAdapter`]. Inbound messages are decoded
//! into packets; outbound packets are written one message per packet, with
//! optional per-message compression and two shortcuts for packets that were
//! serialized ahead of time.

use tether_parser::{encode_packet, Packet, RawData};
use tracing::{debug, trace, warn};

use crate::request::TransportRequest;
use crate::socket::{RawFrameSender, SendOptions, SocketAdapter, SocketEventSink};
use crate::traits::{CloseCallback, SendCallback, Transport, TransportBase, TransportError};

/// Default minimum size, in bytes, for a message to be compressed.
pub const DEFAULT_DEFLATE_THRESHOLD: usize = 1024;

/// Per-message compression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflate {
    /// Payloads shorter than this many bytes are never compressed.
    pub threshold: usize,
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DEFLATE_THRESHOLD,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    base: TransportBase,
    socket: Box<dyn SocketAdapter>,
    per_message_deflate: Option<PerMessageDeflate>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("base", &self.base)
            .field("per_message_deflate", &self.per_message_deflate)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create a WebSocket transport from a request carrying an upgraded socket.
    ///
    /// Compression is off until [`set_per_message_deflate`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the request has no
    /// upgraded socket.
    ///
    /// [`set_per_message_deflate`]: WebSocketTransport::set_per_message_deflate
    pub fn new(mut request: TransportRequest) -> Result<Self, TransportError> {
        let mut socket = request.take_upgraded_socket().ok_or_else(|| {
            TransportError::Configuration("request carries no upgraded socket".into())
        })?;

        let base = TransportBase::new(request.supports_binary());
        base.handle().set_writable(true);
        socket.bind(SocketEventSink::new(base.handle().clone()));

        debug!(remote = ?request.remote_addr(), "WebSocket transport created");

        Ok(Self {
            base,
            socket,
            per_message_deflate: None,
        })
    }

    /// Enable or disable per-message compression.
    pub fn set_per_message_deflate(&mut self, deflate: Option<PerMessageDeflate>) {
        self.per_message_deflate = deflate;
    }

    /// Current compression settings.
    #[must_use]
    pub fn per_message_deflate(&self) -> Option<PerMessageDeflate> {
        self.per_message_deflate
    }

    /// Frame injection is only safe while compression is off, since
    /// pre-built frames are uncompressed.
    fn raw_frame_sender(&self) -> Option<&dyn RawFrameSender> {
        self.socket
            .frame_sender()
            .filter(|_| self.per_message_deflate.is_none())
    }

    fn send_payload(&self, data: RawData, mut options: SendOptions, callback: SendCallback) {
        if let Some(deflate) = self.per_message_deflate {
            let len = data.byte_len();
            if len < deflate.threshold {
                trace!(len, threshold = deflate.threshold, "Below deflate threshold");
                options.compress = Some(false);
            }
        }
        self.socket.send(data, options, callback);
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn handles_upgrades(&self) -> bool {
        true
    }

    fn supports_framing(&self) -> bool {
        true
    }

    fn send(&mut self, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        if !self.writable() {
            warn!("send called while a previous batch is still in flight");
        }

        let handle = self.base.handle().clone();
        handle.set_writable(false);

        let total = packets.len();
        debug!(packets = total, "Writing batch");

        for (i, mut packet) in packets.into_iter().enumerate() {
            let on_sent = handle.write_callback(i + 1 == total);
            let mut options = packet.options.take().unwrap_or_default();
            let send_options = SendOptions {
                compress: options.compress,
            };

            if let Some(encoded) = options.ws_pre_encoded.take() {
                self.send_payload(RawData::Text(encoded), send_options, on_sent);
            } else if let (Some(frame), Some(frames)) =
                (options.ws_pre_encoded_frame.take(), self.raw_frame_sender())
            {
                trace!("Injecting pre-encoded frame");
                frames.send_frame(frame, on_sent);
            } else {
                let data = encode_packet(&packet, handle.supports_binary());
                self.send_payload(data, send_options, on_sent);
            }
        }
    }

    fn do_close(&mut self, callback: Option<CloseCallback>) {
        debug!("Closing WebSocket");
        self.socket.close();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock::{MockSocket, Written};
    use crate::socket::SocketEvent;
    use crate::traits::{ReadyState, TransportEvent};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tether_parser::{PacketOptions, PreEncodedFrame};

    fn transport(socket: &MockSocket) -> WebSocketTransport {
        let request = TransportRequest::new().with_upgraded_socket(Box::new(socket.clone()));
        WebSocketTransport::new(request).unwrap()
    }

    fn drains(events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Drain) {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn test_properties() {
        let socket = MockSocket::new();
        let ws = transport(&socket);

        assert_eq!(ws.name(), "websocket");
        assert!(ws.handles_upgrades());
        assert!(ws.supports_framing());
        assert!(ws.writable());
        assert!(ws.per_message_deflate().is_none());
        assert_eq!(ws.ready_state(), ReadyState::Open);
    }

    #[test]
    fn test_missing_socket_is_configuration_error() {
        match WebSocketTransport::new(TransportRequest::new()) {
            Err(TransportError::Configuration(_)) => {}
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_send_preserves_order_and_drains_once() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        let mut events = ws.take_events().unwrap();

        ws.send(vec![
            Packet::message("a"),
            Packet::message("b"),
            Packet::message("c"),
        ]);

        assert!(!ws.writable());
        let texts: Vec<_> = socket
            .written()
            .into_iter()
            .map(|w| match w {
                Written::Message(data, _) => data,
                Written::Frame(_) => panic!("unexpected frame"),
            })
            .collect();
        assert_eq!(
            texts,
            vec![RawData::from("4a"), RawData::from("4b"), RawData::from("4c")]
        );

        socket.complete_next(Ok(()));
        socket.complete_next(Ok(()));
        assert!(!ws.writable());
        assert_eq!(drains(&mut events), 0);

        socket.complete_next(Ok(()));
        assert!(ws.writable());
        assert_eq!(drains(&mut events), 1);
    }

    #[test]
    fn test_failed_last_write_keeps_unwritable() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        let mut events = ws.take_events().unwrap();

        ws.send(vec![Packet::message("a"), Packet::message("b")]);
        socket.complete_next(Ok(()));
        socket.complete_next(Err(TransportError::ConnectionClosed));

        assert!(!ws.writable());
        match events.try_recv() {
            Ok(TransportEvent::Error(TransportError::Write { message, .. })) => {
                assert_eq!(message, "write error");
            }
            other => panic!("Expected write error, got {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_compress_flag_copied_per_packet() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        ws.send(vec![
            Packet::message("a").with_options(PacketOptions::default().with_compress(true)),
            Packet::message("b"),
        ]);

        assert_eq!(
            socket.written(),
            vec![
                Written::Message(RawData::from("4a"), SendOptions { compress: Some(true) }),
                Written::Message(RawData::from("4b"), SendOptions { compress: None }),
            ]
        );
    }

    #[test]
    fn test_deflate_threshold_forces_uncompressed() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        ws.set_per_message_deflate(Some(PerMessageDeflate { threshold: 1024 }));

        let big = "x".repeat(2048);
        ws.send(vec![
            Packet::message("small").with_options(PacketOptions::default().with_compress(true)),
            Packet::message(big.clone()).with_options(PacketOptions::default().with_compress(true)),
        ]);

        assert_eq!(
            socket.written(),
            vec![
                Written::Message(RawData::from("4small"), SendOptions { compress: Some(false) }),
                Written::Message(
                    RawData::Text(format!("4{big}")),
                    SendOptions { compress: Some(true) }
                ),
            ]
        );
    }

    #[test]
    fn test_pre_encoded_sent_verbatim() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        let packet = Packet::message("ignored")
            .with_options(PacketOptions::default().with_pre_encoded("X"));
        ws.send(vec![packet]);

        assert_eq!(
            socket.written(),
            vec![Written::Message(RawData::from("X"), SendOptions::default())]
        );
    }

    #[test]
    fn test_pre_encoded_frame_fast_path() {
        let socket = MockSocket::with_raw_frames();
        let mut ws = transport(&socket);
        let mut events = ws.take_events().unwrap();

        let frame = PreEncodedFrame::text(Bytes::from_static(b"4hi"));
        let packet = Packet::message("hi")
            .with_options(PacketOptions::default().with_pre_encoded_frame(frame.clone()));
        ws.send(vec![packet]);

        assert_eq!(socket.written(), vec![Written::Frame(frame)]);
        socket.complete_all();
        assert!(ws.writable());
        assert_eq!(drains(&mut events), 1);
    }

    #[test]
    fn test_pre_encoded_frame_ignored_with_compression() {
        let socket = MockSocket::with_raw_frames();
        let mut ws = transport(&socket);
        ws.set_per_message_deflate(Some(PerMessageDeflate::default()));

        let frame = PreEncodedFrame::text(Bytes::from_static(b"4hi"));
        let packet = Packet::message("hi")
            .with_options(PacketOptions::default().with_pre_encoded_frame(frame));
        ws.send(vec![packet]);

        assert_eq!(
            socket.written(),
            vec![Written::Message(RawData::from("4hi"), SendOptions { compress: Some(false) })]
        );
    }

    #[test]
    fn test_pre_encoded_string_wins_over_frame() {
        let socket = MockSocket::with_raw_frames();
        let mut ws = transport(&socket);

        let options = PacketOptions::default()
            .with_pre_encoded("S")
            .with_pre_encoded_frame(PreEncodedFrame::text(Bytes::from_static(b"F")));
        ws.send(vec![Packet::message("hi").with_options(options)]);

        assert_eq!(
            socket.written(),
            vec![Written::Message(RawData::from("S"), SendOptions::default())]
        );
    }

    #[test]
    fn test_deflate_threshold_applies_to_pre_encoded() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        ws.set_per_message_deflate(Some(PerMessageDeflate { threshold: 1024 }));

        let big = "y".repeat(1024);
        ws.send(vec![
            Packet::message("a").with_options(
                PacketOptions::default().with_compress(true).with_pre_encoded("S"),
            ),
            Packet::message("b").with_options(
                PacketOptions::default().with_compress(true).with_pre_encoded(big.clone()),
            ),
        ]);

        assert_eq!(
            socket.written(),
            vec![
                Written::Message(RawData::from("S"), SendOptions { compress: Some(false) }),
                Written::Message(RawData::Text(big), SendOptions { compress: Some(true) }),
            ]
        );
    }

    #[test]
    fn test_pre_encoded_frame_needs_frame_sender() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        let frame = PreEncodedFrame::text(Bytes::from_static(b"4hi"));
        let packet = Packet::message("hi")
            .with_options(PacketOptions::default().with_pre_encoded_frame(frame));
        ws.send(vec![packet]);

        assert_eq!(
            socket.written(),
            vec![Written::Message(RawData::from("4hi"), SendOptions::default())]
        );
    }

    #[test]
    fn test_binary_packets_sent_as_binary() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        ws.send(vec![Packet::message(vec![1u8, 2, 3])]);

        assert_eq!(
            socket.written(),
            vec![Written::Message(
                RawData::Binary(Bytes::from_static(&[1, 2, 3])),
                SendOptions::default()
            )]
        );
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        ws.send(Vec::new());

        assert!(ws.writable());
        assert!(socket.written().is_empty());
    }

    #[test]
    fn test_inbound_events() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        let mut events = ws.take_events().unwrap();

        socket.emit(SocketEvent::Message {
            payload: Bytes::from_static(b"4hello"),
            binary: false,
        });
        socket.emit(SocketEvent::Error("connection reset".into()));
        socket.emit(SocketEvent::Close);
        socket.emit(SocketEvent::Close);

        assert!(matches!(events.try_recv(), Ok(TransportEvent::Packet(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Error(TransportError::Channel { .. }))
        ));
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Close)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_do_close_closes_socket_and_calls_back_once() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);
        let mut events = ws.take_events().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        ws.do_close(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert_eq!(socket.closes(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        socket.emit(SocketEvent::Close);
        assert_eq!(socket.closes(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Close)));
    }

    #[test]
    fn test_close_only_once() {
        let socket = MockSocket::new();
        let mut ws = transport(&socket);

        ws.close(None);
        assert_eq!(ws.ready_state(), ReadyState::Closing);
        ws.close(None);

        assert_eq!(socket.closes(), 1);
    }
}
