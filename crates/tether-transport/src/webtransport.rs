//! WebTransport transport implementation.
//!
//! Runs over one bidirectional stream of a WebTransport session. Streams
//! carry bytes, not messages, so each encoded packet is written as a
//! length-prefixed record:
//!
//! - 4 bytes: Big-endian payload length
//! - 1 byte: `0` for text, `1` for binary
//! - N bytes: payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tether_parser::{encode_packet, Packet, RawData};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::request::TransportRequest;
use crate::socket::StreamAdapter;
use crate::traits::{BaseHandle, CloseCallback, SendCallback, Transport, TransportBase, TransportError};

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 5;

const TEXT_FLAG: u8 = 0;
const BINARY_FLAG: u8 = 1;

fn invalid_record(description: impl Into<String>) -> TransportError {
    TransportError::Channel {
        message: "invalid record".into(),
        description: description.into(),
    }
}

/// Encode one payload as a record.
///
/// # Errors
///
/// Returns a write error if the payload exceeds [`MAX_RECORD_SIZE`].
pub fn encode_record(data: &RawData) -> Result<Bytes, TransportError> {
    let (flag, payload) = match data {
        RawData::Text(text) => (TEXT_FLAG, text.as_bytes()),
        RawData::Binary(bytes) => (BINARY_FLAG, bytes.as_ref()),
    };

    if payload.len() > MAX_RECORD_SIZE {
        return Err(TransportError::Write {
            message: "record too large".into(),
            description: format!("{} bytes exceeds maximum {}", payload.len(), MAX_RECORD_SIZE),
        });
    }

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(flag);
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Try to decode a record from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(data))` if a complete record was decoded, `Ok(None)` if
/// more data is needed.
///
/// # Errors
///
/// Returns an error if the record is too large, has an unknown flag, or
/// carries invalid UTF-8 text.
pub fn decode_record(buf: &mut BytesMut) -> Result<Option<RawData>, TransportError> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_RECORD_SIZE {
        return Err(invalid_record(format!(
            "{} bytes exceeds maximum {}",
            length, MAX_RECORD_SIZE
        )));
    }

    let flag = buf[4];
    if flag != TEXT_FLAG && flag != BINARY_FLAG {
        return Err(invalid_record(format!("unknown flag {flag}")));
    }

    if buf.len() < RECORD_HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(RECORD_HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    if flag == BINARY_FLAG {
        return Ok(Some(RawData::Binary(payload)));
    }

    String::from_utf8(payload.to_vec())
        .map(|text| Some(RawData::Text(text)))
        .map_err(|e| invalid_record(e.to_string()))
}

enum Command {
    Write(Bytes, SendCallback),
    Close,
}

/// WebTransport transport.
#[derive(Debug)]
pub struct WebTransportTransport {
    base: TransportBase,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Write(data, _) => write!(f, "Write({} bytes)", data.len()),
            Command::Close => f.write_str("Close"),
        }
    }
}

impl WebTransportTransport {
    /// Create a WebTransport transport from a request carrying a stream.
    ///
    /// Spawns the stream's reader and writer, so it must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the request has no stream.
    pub fn new(mut request: TransportRequest) -> Result<Self, TransportError> {
        let stream = request.take_stream().ok_or_else(|| {
            TransportError::Configuration("request carries no WebTransport stream".into())
        })?;

        let base = TransportBase::new(request.supports_binary());
        base.handle().set_writable(true);

        let (read, write) = tokio::io::split(stream);
        let (commands, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write, queued));
        tokio::spawn(read_loop(read, base.handle().clone()));

        debug!(remote = ?request.remote_addr(), "WebTransport transport created");

        Ok(Self { base, commands })
    }

    fn dispatch(&self, command: Command) {
        if let Err(mpsc::error::SendError(Command::Write(_, callback))) = self.commands.send(command) {
            callback(Err(TransportError::ConnectionClosed));
        }
    }
}

impl Transport for WebTransportTransport {
    fn name(&self) -> &'static str {
        "webtransport"
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
        for (i, packet) in packets.iter().enumerate() {
            let on_sent = handle.write_callback(i + 1 == total);
            let data = encode_packet(packet, handle.supports_binary());
            match encode_record(&data) {
                Ok(record) => {
                    trace!(bytes = record.len(), "Queueing record");
                    self.dispatch(Command::Write(record, on_sent));
                }
                Err(e) => on_sent(Err(e)),
            }
        }
    }

    fn do_close(&mut self, callback: Option<CloseCallback>) {
        debug!("Closing WebTransport stream");
        self.dispatch(Command::Close);
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

async fn write_loop(
    mut write: WriteHalf<Box<dyn StreamAdapter>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write(record, callback) => {
                let result = match write.write_all(&record).await {
                    Ok(()) => write.flush().await,
                    Err(e) => Err(e),
                };
                callback(result.map_err(TransportError::Io));
            }
            Command::Close => {
                if let Err(e) = write.shutdown().await {
                    debug!("Stream shutdown failed: {}", e);
                }
                break;
            }
        }
    }
}

async fn read_loop(mut read: ReadHalf<Box<dyn StreamAdapter>>, handle: BaseHandle) {
    let mut buf = BytesMut::with_capacity(4096);

    'read: loop {
        loop {
            match decode_record(&mut buf) {
                Ok(Some(data)) => handle.on_data(data),
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping stream: {}", e);
                    handle.report(e);
                    break 'read;
                }
            }
        }

        match read.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("WebTransport stream ended");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                handle.on_error("stream error", e.to_string());
                break;
            }
        }
    }

    handle.on_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TransportEvent;
    use tokio::io::DuplexStream;

    fn pair() -> (DuplexStream, WebTransportTransport) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let request = TransportRequest::new().with_stream(Box::new(server));
        (client, WebTransportTransport::new(request).unwrap())
    }

    #[test]
    fn test_record_roundtrip_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_record(&RawData::from("4hi")).unwrap());
        buf.extend_from_slice(&encode_record(&RawData::Binary(Bytes::from_static(b"\x01"))).unwrap());
        buf.extend_from_slice(&[0, 0, 0]);

        assert_eq!(decode_record(&mut buf).unwrap(), Some(RawData::from("4hi")));
        assert_eq!(
            decode_record(&mut buf).unwrap(),
            Some(RawData::Binary(Bytes::from_static(b"\x01")))
        );
        assert_eq!(decode_record(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_record_header_layout() {
        let record = encode_record(&RawData::from("4hello")).unwrap();
        assert_eq!(&record[..], b"\x00\x00\x00\x06\x004hello");
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        let mut oversized = BytesMut::new();
        oversized.put_u32((MAX_RECORD_SIZE + 1) as u32);
        oversized.put_u8(TEXT_FLAG);
        assert!(decode_record(&mut oversized).is_err());

        let mut bad_flag = BytesMut::from(&b"\x00\x00\x00\x01\x07x"[..]);
        assert!(decode_record(&mut bad_flag).is_err());

        let mut bad_text = BytesMut::from(&b"\x00\x00\x00\x01\x00\xff"[..]);
        assert!(decode_record(&mut bad_text).is_err());
    }

    #[test]
    fn test_missing_stream_is_configuration_error() {
        match WebTransportTransport::new(TransportRequest::new()) {
            Err(TransportError::Configuration(_)) => {}
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_writes_records_and_drains() {
        let (mut client, mut transport) = pair();
        let mut events = transport.take_events().unwrap();

        assert_eq!(transport.name(), "webtransport");
        transport.send(vec![Packet::message("a"), Packet::message(vec![9u8])]);
        assert!(!transport.writable());

        let mut received = vec![0u8; 7 + 6];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], b"\x00\x00\x00\x02\x004a\x00\x00\x00\x01\x01\x09");

        assert!(matches!(events.recv().await, Some(TransportEvent::Drain)));
        assert!(transport.writable());
    }

    #[tokio::test]
    async fn test_inbound_records_and_close() {
        let (mut client, mut transport) = pair();
        let mut events = transport.take_events().unwrap();

        let record = encode_record(&RawData::from("4hello")).unwrap();
        client.write_all(&record[..3]).await.unwrap();
        client.write_all(&record[3..]).await.unwrap();

        match events.recv().await {
            Some(TransportEvent::Packet(packet)) => assert_eq!(packet, Packet::message("hello")),
            other => panic!("Expected packet, got {:?}", other),
        }

        drop(client);
        assert!(matches!(events.recv().await, Some(TransportEvent::Close)));
    }
}
