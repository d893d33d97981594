//! Socket adapter for axum's upgraded WebSocket.
//!
//! axum does not expose frame-level writes, so this adapter offers no
//! [`RawFrameSender`](crate::socket::RawFrameSender) and pre-encoded frames
//! always go through the regular write path.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_parser::RawData;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::socket::{log_ignored_compress, SendOptions, SocketAdapter, SocketEvent, SocketEventSink};
use crate::traits::{SendCallback, TransportError};

enum Command {
    Send(Message, SendCallback),
    Close,
}

/// An axum WebSocket adapted for [`WebSocketTransport`].
///
/// Binding spawns tasks, so it must happen inside a tokio runtime.
///
/// [`WebSocketTransport`]: crate::WebSocketTransport
pub struct AxumSocket {
    socket: Option<WebSocket>,
    commands: mpsc::UnboundedSender<Command>,
    queued: Option<mpsc::UnboundedReceiver<Command>>,
}

impl AxumSocket {
    /// Wrap an upgraded axum WebSocket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        let (commands, queued) = mpsc::unbounded_channel();
        Self {
            socket: Some(socket),
            commands,
            queued: Some(queued),
        }
    }

    fn dispatch(&self, command: Command) {
        if let Err(mpsc::error::SendError(Command::Send(_, callback))) = self.commands.send(command) {
            callback(Err(TransportError::ConnectionClosed));
        }
    }
}

impl SocketAdapter for AxumSocket {
    fn bind(&mut self, sink: SocketEventSink) {
        let (Some(socket), Some(queued)) = (self.socket.take(), self.queued.take()) else {
            warn!("WebSocket already bound");
            return;
        };

        let (write, read) = socket.split();
        tokio::spawn(write_loop(write, queued));
        tokio::spawn(read_loop(read, sink));
    }

    fn send(&self, data: RawData, options: SendOptions, callback: SendCallback) {
        log_ignored_compress(options);
        let message = match data {
            RawData::Text(text) => Message::Text(text),
            RawData::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.dispatch(Command::Send(message, callback));
    }

    fn close(&self) {
        self.dispatch(Command::Close);
    }
}

async fn write_loop(
    mut write: SplitSink<WebSocket, Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send(message, callback) => {
                let result = write.send(message).await.map_err(|e| TransportError::Write {
                    message: "WebSocket send failed".into(),
                    description: e.to_string(),
                });
                callback(result);
            }
            Command::Close => {
                if let Err(e) = write.close().await {
                    debug!("WebSocket close handshake failed: {}", e);
                }
                break;
            }
        }
    }
}

async fn read_loop(mut read: SplitStream<WebSocket>, sink: SocketEventSink) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => sink.emit(SocketEvent::Message {
                payload: Bytes::from(text.into_bytes()),
                binary: false,
            }),
            Ok(Message::Binary(data)) => sink.emit(SocketEvent::Message {
                payload: Bytes::from(data),
                binary: true,
            }),
            // Keep reading so the close reply is flushed; the stream then ends
            Ok(Message::Close(frame)) => debug!(?frame, "Received close frame"),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                warn!("WebSocket error: {}", e);
                sink.emit(SocketEvent::Error(e.to_string()));
                break;
            }
        }
    }

    debug!("WebSocket stream ended");
    sink.emit(SocketEvent::Close);
}
