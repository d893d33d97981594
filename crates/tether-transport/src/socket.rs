//! Capability contracts for the channels transports sit on.
//!
//! A [`SocketAdapter`] is an already-upgraded, message-oriented full-duplex
//! socket. A [`StreamAdapter`] is a plain bidirectional byte stream, such as
//! one stream of a WebTransport session.

use bytes::Bytes;
use tether_parser::{PreEncodedFrame, RawData};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::traits::{BaseHandle, SendCallback};

/// An event observed on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete inbound message.
    Message {
        /// Message payload.
        payload: Bytes,
        /// Whether the peer sent a binary message.
        binary: bool,
    },
    /// The socket closed.
    Close,
    /// The socket failed.
    Error(String),
}

/// Where a socket adapter reports inbound events.
///
/// A transport hands exactly one sink to its socket when it is built.
#[derive(Debug, Clone)]
pub struct SocketEventSink {
    handle: BaseHandle,
}

impl SocketEventSink {
    pub(crate) fn new(handle: BaseHandle) -> Self {
        Self { handle }
    }

    /// Deliver an event to the owning transport.
    pub fn emit(&self, event: SocketEvent) {
        match event {
            SocketEvent::Message { payload, binary } => self.message(payload, binary),
            SocketEvent::Close => self.handle.on_close(),
            SocketEvent::Error(description) => self.handle.on_error("websocket error", description),
        }
    }

    fn message(&self, payload: Bytes, binary: bool) {
        if binary {
            self.handle.on_data(RawData::Binary(payload));
            return;
        }

        match String::from_utf8(payload.to_vec()) {
            Ok(text) => self.handle.on_data(RawData::Text(text)),
            Err(e) => self.handle.on_error("invalid text message", e.to_string()),
        }
    }
}

/// Options for a single socket write.
///
/// Built fresh for every payload; adapters may consume or alter their copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Whether to compress the message. `None` leaves it to the socket.
    pub compress: Option<bool>,
}

/// A full-duplex, message-oriented socket.
pub trait SocketAdapter: Send {
    /// Register where inbound events go. Called once, before any other method.
    fn bind(&mut self, sink: SocketEventSink);

    /// Write one message; `callback` runs once the write completes or fails.
    fn send(&self, data: RawData, options: SendOptions, callback: SendCallback);

    /// Close the socket without waiting for the peer.
    fn close(&self);

    /// Direct frame injection, if the socket supports it.
    fn frame_sender(&self) -> Option<&dyn RawFrameSender> {
        None
    }
}

/// Writes pre-built frames, bypassing message framing and compression.
pub trait RawFrameSender {
    /// Write one frame; `callback` runs once the write completes or fails.
    fn send_frame(&self, frame: PreEncodedFrame, callback: SendCallback);
}

/// A bidirectional byte stream.
pub trait StreamAdapter: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> StreamAdapter for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) fn log_ignored_compress(options: SendOptions) {
    if options.compress == Some(true) {
        trace!("Socket has no per-message compression, sending uncompressed");
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory socket for exercising transports.

    use super::*;
    use crate::traits::TransportError;
    use std::sync::{Arc, Mutex};

    /// What the mock saw, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Written {
        Message(RawData, SendOptions),
        Frame(PreEncodedFrame),
    }

    #[derive(Default)]
    pub struct State {
        pub written: Vec<Written>,
        pub callbacks: Vec<SendCallback>,
        pub closes: usize,
        pub sink: Option<SocketEventSink>,
    }

    /// Records writes and holds their callbacks until the test completes them.
    #[derive(Clone, Default)]
    pub struct MockSocket {
        pub state: Arc<Mutex<State>>,
        raw_frames: bool,
    }

    impl MockSocket {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_raw_frames() -> Self {
            Self {
                raw_frames: true,
                ..Self::default()
            }
        }

        pub fn written(&self) -> Vec<Written> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn closes(&self) -> usize {
            self.state.lock().unwrap().closes
        }

        pub fn pending(&self) -> usize {
            self.state.lock().unwrap().callbacks.len()
        }

        /// Complete the oldest outstanding write.
        pub fn complete_next(&self, result: Result<(), TransportError>) {
            let callback = self.state.lock().unwrap().callbacks.remove(0);
            callback(result);
        }

        /// Complete every outstanding write successfully.
        pub fn complete_all(&self) {
            while self.pending() > 0 {
                self.complete_next(Ok(()));
            }
        }

        pub fn emit(&self, event: SocketEvent) {
            let sink = self.state.lock().unwrap().sink.clone();
            sink.expect("socket not bound").emit(event);
        }
    }

    impl SocketAdapter for MockSocket {
        fn bind(&mut self, sink: SocketEventSink) {
            self.state.lock().unwrap().sink = Some(sink);
        }

        fn send(&self, data: RawData, options: SendOptions, callback: SendCallback) {
            let mut state = self.state.lock().unwrap();
            state.written.push(Written::Message(data, options));
            state.callbacks.push(callback);
        }

        fn close(&self) {
            self.state.lock().unwrap().closes += 1;
        }

        fn frame_sender(&self) -> Option<&dyn RawFrameSender> {
            if self.raw_frames {
                Some(self)
            } else {
                None
            }
        }
    }

    impl RawFrameSender for MockSocket {
        fn send_frame(&self, frame: PreEncodedFrame, callback: SendCallback) {
            let mut state = self.state.lock().unwrap();
            state.written.push(Written::Frame(frame));
            state.callbacks.push(callback);
        }
    }
}
