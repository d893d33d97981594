//! Socket adapter for tokio-tungstenite streams.
//!
//! The stream is split in two tasks once the socket is bound: a reader that
//! forwards inbound messages to the transport, and a writer that performs
//! queued writes in order and completes their callbacks.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_parser::{PreEncodedFrame, RawData};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, warn};

use crate::socket::{
    log_ignored_compress, RawFrameSender, SendOptions, SocketAdapter, SocketEvent, SocketEventSink,
};
use crate::traits::{SendCallback, TransportError};

enum Command {
    Send(Message, SendCallback),
    Close,
}

/// A tungstenite WebSocket stream adapted for [`WebSocketTransport`].
///
/// Binding spawns tasks, so it must happen inside a tokio runtime.
///
/// [`WebSocketTransport`]: crate::WebSocketTransport
pub struct TungsteniteSocket<S> {
    stream: Option<WebSocketStream<S>>,
    commands: mpsc::UnboundedSender<Command>,
    queued: Option<mpsc::UnboundedReceiver<Command>>,
}

impl<S> TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (commands, queued) = mpsc::unbounded_channel();
        Self {
            stream: Some(stream),
            commands,
            queued: Some(queued),
        }
    }

    /// Perform the server side of the WebSocket handshake on a raw stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn accept(stream: S) -> Result<Self, TransportError> {
        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Channel {
                message: "WebSocket handshake failed".into(),
                description: e.to_string(),
            }
        })?;
        Ok(Self::new(ws_stream))
    }

    fn dispatch(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::Send(_, callback) = command {
                callback(Err(TransportError::ConnectionClosed));
            }
        }
    }
}

impl<S> SocketAdapter for TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn bind(&mut self, sink: SocketEventSink) {
        let (Some(stream), Some(queued)) = (self.stream.take(), self.queued.take()) else {
            warn!("WebSocket already bound");
            return;
        };

        let (write, read) = stream.split();
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

    fn frame_sender(&self) -> Option<&dyn RawFrameSender> {
        Some(self)
    }
}

impl<S> RawFrameSender for TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send_frame(&self, frame: PreEncodedFrame, callback: SendCallback) {
        let opcode = OpCode::Data(if frame.binary { Data::Binary } else { Data::Text });
        let frame = Frame::message(frame.payload.to_vec(), opcode, true);
        self.dispatch(Command::Send(Message::Frame(frame), callback));
    }
}

async fn write_loop<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
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

async fn read_loop<S>(mut read: SplitStream<WebSocketStream<S>>, sink: SocketEventSink)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
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
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
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
