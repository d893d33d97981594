//! HTTP long-polling transports.
//!
//! Polling is driven from the outside: the HTTP layer reports each GET
//! (a poll waiting for data) and each POST (a body of inbound packets), and
//! collects the response body once the transport has written a batch.
//!
//! [`JsonpPollingTransport`] is the same transport for clients that can only
//! poll through `<script>` tags: responses are wrapped in a callback
//! invocation and inbound bodies arrive form-encoded.

use tether_parser::{decode_payload, encode_payload, Packet, PacketType, RECORD_SEPARATOR};
use tracing::{debug, warn};

use crate::request::{TransportRequest, JSONP_PARAM};
use crate::traits::{CloseCallback, Transport, TransportBase, TransportError};

/// Long-polling transport.
#[derive(Debug)]
pub struct PollingTransport {
    base: TransportBase,
    response: Option<String>,
    should_close: Option<DeferredClose>,
}

struct DeferredClose(CloseCallback);

impl std::fmt::Debug for DeferredClose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeferredClose")
    }
}

impl PollingTransport {
    /// Create a polling transport. It becomes writable on the first poll.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the other constructors.
    pub fn new(request: TransportRequest) -> Result<Self, TransportError> {
        debug!(remote = ?request.remote_addr(), "Polling transport created");
        Ok(Self {
            base: TransportBase::new(request.supports_binary()),
            response: None,
            should_close: None,
        })
    }

    /// A GET poll arrived and is waiting for data.
    ///
    /// # Errors
    ///
    /// Returns an error, and reports it to the upper layer, if a previous
    /// poll is still waiting.
    pub fn on_poll_request(&mut self) -> Result<(), TransportError> {
        if self.writable() {
            let overlap = || TransportError::Channel {
                message: "overlap from client".into(),
                description: "a poll is already pending".into(),
            };
            self.base.handle().report(overlap());
            return Err(overlap());
        }

        debug!("Poll request");
        self.base.handle().on_drain();

        if self.should_close.is_some() && self.writable() {
            debug!("Triggering empty send to flush close packet");
            self.send(vec![Packet::noop()]);
        }

        Ok(())
    }

    /// A POST arrived carrying an encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error, and reports it to the upper layer, if the payload
    /// cannot be decoded.
    pub fn on_data_request(&mut self, body: &str) -> Result<(), TransportError> {
        let packets = match decode_payload(body) {
            Ok(packets) => packets,
            Err(e) => {
                self.base.handle().report(TransportError::Parse(e.clone()));
                return Err(TransportError::Parse(e));
            }
        };

        for packet in packets {
            if packet.packet_type == PacketType::Close {
                debug!("Got close packet from client");
                self.base.handle().on_close();
                break;
            }
            self.base.handle().on_packet(packet);
        }

        Ok(())
    }

    /// Take the body for the waiting poll, if a batch has been written.
    pub fn take_response(&mut self) -> Option<String> {
        self.response.take()
    }
}

impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn handles_upgrades(&self) -> bool {
        false
    }

    fn supports_framing(&self) -> bool {
        false
    }

    fn send(&mut self, mut packets: Vec<Packet>) {
        if !self.writable() {
            warn!("send called without a pending poll");
        }
        self.base.handle().set_writable(false);

        if let Some(DeferredClose(callback)) = self.should_close.take() {
            debug!("Appending close packet to payload");
            packets.push(Packet::close());
            callback();
        }

        let payload = encode_payload(&packets);
        debug!(packets = packets.len(), bytes = payload.len(), "Writing payload");

        self.response = Some(match self.response.take() {
            Some(mut pending) => {
                pending.push(RECORD_SEPARATOR);
                pending.push_str(&payload);
                pending
            }
            None => payload,
        });
    }

    fn do_close(&mut self, callback: Option<CloseCallback>) {
        let handle = self.base.handle().clone();
        let on_close: CloseCallback = Box::new(move || {
            if let Some(callback) = callback {
                callback();
            }
            handle.on_close();
        });

        if self.writable() {
            debug!("Transport writable, closing right away");
            self.send(vec![Packet::close()]);
            on_close();
        } else {
            debug!("Transport not writable, buffering orderly close");
            self.should_close = Some(DeferredClose(on_close));
        }
    }

    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        &mut self.base
    }
}

/// Long-polling transport for JSONP clients.
#[derive(Debug)]
pub struct JsonpPollingTransport {
    inner: PollingTransport,
    head: String,
}

const JSONP_FOOT: &str = ");";

/// Form field carrying the payload of a JSONP POST.
const JSONP_DATA_FIELD: &str = "d";

fn form_field(body: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

impl JsonpPollingTransport {
    /// Create a JSONP polling transport. Non-digits in the `j` index are dropped.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the other constructors.
    pub fn new(request: TransportRequest) -> Result<Self, TransportError> {
        let index: String = request
            .query(JSONP_PARAM)
            .unwrap_or_default()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();

        Ok(Self {
            inner: PollingTransport::new(request)?,
            head: format!("___eio[{index}]("),
        })
    }

    /// A GET poll arrived and is waiting for data.
    ///
    /// # Errors
    ///
    /// See [`PollingTransport::on_poll_request`].
    pub fn on_poll_request(&mut self) -> Result<(), TransportError> {
        self.inner.on_poll_request()
    }

    /// A POST arrived; `body` is the raw `application/x-www-form-urlencoded`
    /// form whose `d` field carries the payload.
    ///
    /// # Errors
    ///
    /// Returns an error, and reports it to the upper layer, if the form has
    /// no `d` field. Otherwise see [`PollingTransport::on_data_request`].
    pub fn on_data_request(&mut self, body: &str) -> Result<(), TransportError> {
        let Some(data) = form_field(body, JSONP_DATA_FIELD) else {
            let missing = || TransportError::Channel {
                message: "invalid jsonp body".into(),
                description: format!("missing `{JSONP_DATA_FIELD}` field"),
            };
            self.inner.base.handle().report(missing());
            return Err(missing());
        };
        self.inner.on_data_request(&unescape_newlines(&data))
    }

    /// Take the script body for the waiting poll, if a batch has been written.
    pub fn take_response(&mut self) -> Option<String> {
        self.inner.take_response().map(|payload| self.wrap(&payload))
    }

    fn wrap(&self, payload: &str) -> String {
        let js = serde_json::Value::String(payload.to_owned())
            .to_string()
            .replace('\u{2028}', "\\u2028")
            .replace('\u{2029}', "\\u2029");
        format!("{}{}{}", self.head, js, JSONP_FOOT)
    }
}

/// Undo the client's newline escaping: `\n` becomes a newline and `\\n`
/// becomes a literal `\n`.
fn unescape_newlines(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('\\') => {
                let mut lookahead = chars.clone();
                lookahead.next();
                if lookahead.peek() == Some(&'n') {
                    chars.next();
                    chars.next();
                    out.push_str("\\n");
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

impl Transport for JsonpPollingTransport {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn handles_upgrades(&self) -> bool {
        self.inner.handles_upgrades()
    }

    fn supports_framing(&self) -> bool {
        self.inner.supports_framing()
    }

    fn send(&mut self, packets: Vec<Packet>) {
        self.inner.send(packets);
    }

    fn do_close(&mut self, callback: Option<CloseCallback>) {
        self.inner.do_close(callback);
    }

    fn base(&self) -> &TransportBase {
        self.inner.base()
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        self.inner.base_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ReadyState, TransportEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn polling() -> PollingTransport {
        PollingTransport::new(TransportRequest::new()).unwrap()
    }

    #[test]
    fn test_properties() {
        let transport = polling();
        assert_eq!(transport.name(), "polling");
        assert!(!transport.handles_upgrades());
        assert!(!transport.supports_framing());
        assert!(!transport.writable());
    }

    #[test]
    fn test_poll_then_send() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();

        transport.on_poll_request().unwrap();
        assert!(transport.writable());
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Drain)));

        transport.send(vec![Packet::message("a"), Packet::message(vec![1u8])]);
        assert!(!transport.writable());
        assert_eq!(transport.take_response().as_deref(), Some("4a\x1ebAQ=="));
        assert!(transport.take_response().is_none());
    }

    #[test]
    fn test_overlapping_poll_is_rejected() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();

        transport.on_poll_request().unwrap();
        assert!(transport.on_poll_request().is_err());

        assert!(matches!(events.try_recv(), Ok(TransportEvent::Drain)));
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Error(TransportError::Channel { .. }))
        ));
    }

    #[test]
    fn test_data_request() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();

        transport.on_data_request("4hello\x1e2\x1e1\x1e4never").unwrap();

        match events.try_recv() {
            Ok(TransportEvent::Packet(p)) => assert_eq!(p, Packet::message("hello")),
            other => panic!("Expected packet, got {:?}", other),
        }
        match events.try_recv() {
            Ok(TransportEvent::Packet(p)) => assert_eq!(p, Packet::ping()),
            other => panic!("Expected packet, got {:?}", other),
        }
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Close)));
        assert!(events.try_recv().is_err());
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn test_bad_data_request() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();

        assert!(transport.on_data_request("9x").is_err());
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Error(TransportError::Parse(_)))
        ));
    }

    #[test]
    fn test_close_while_writable() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        transport.on_poll_request().unwrap();
        let counter = calls.clone();
        transport.close(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert_eq!(transport.take_response().as_deref(), Some("1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Drain)));
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Close)));
    }

    #[test]
    fn test_close_deferred_until_poll() {
        let mut transport = polling();
        let mut events = transport.take_events().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        transport.close(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(transport.take_response().is_none());

        transport.on_poll_request().unwrap();

        assert_eq!(transport.take_response().as_deref(), Some("6\x1e1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Drain)));
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Close)));
    }

    #[test]
    fn test_jsonp_wraps_response() {
        let request = TransportRequest::new().with_query(JSONP_PARAM, "3abc");
        let mut transport = JsonpPollingTransport::new(request).unwrap();

        transport.on_poll_request().unwrap();
        transport.send(vec![Packet::message("say \"hi\"\u{2028}")]);

        assert_eq!(
            transport.take_response().as_deref(),
            Some("___eio[3](\"4say \\\"hi\\\"\\u2028\");")
        );
    }

    fn jsonp() -> JsonpPollingTransport {
        JsonpPollingTransport::new(TransportRequest::new().with_query(JSONP_PARAM, "0")).unwrap()
    }

    fn next_packet(events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>) -> Packet {
        match events.try_recv() {
            Ok(TransportEvent::Packet(p)) => p,
            other => panic!("Expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_jsonp_data_request_reads_form_field() {
        let mut transport = jsonp();
        let mut events = transport.take_events().unwrap();

        transport.on_data_request("d=4hello").unwrap();
        transport.on_data_request("x=1&d=4two+words%21").unwrap();

        assert_eq!(next_packet(&mut events), Packet::message("hello"));
        assert_eq!(next_packet(&mut events), Packet::message("two words!"));
    }

    #[test]
    fn test_jsonp_data_request_without_field() {
        let mut transport = jsonp();
        let mut events = transport.take_events().unwrap();

        assert!(matches!(
            transport.on_data_request("4hello"),
            Err(TransportError::Channel { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Error(TransportError::Channel { .. }))
        ));
    }

    #[test]
    fn test_jsonp_data_request_unescapes_newlines() {
        let mut transport = jsonp();
        let mut events = transport.take_events().unwrap();

        // `4a\nb` and `4a\\nb` after form decoding
        transport.on_data_request("d=4a%5Cnb").unwrap();
        transport.on_data_request("d=4a%5C%5Cnb").unwrap();

        assert_eq!(next_packet(&mut events), Packet::message("a\nb"));
        assert_eq!(next_packet(&mut events), Packet::message(r"a\nb"));
    }

    #[test]
    fn test_unescape_newlines() {
        assert_eq!(unescape_newlines(r"a\nb"), "a\nb");
        assert_eq!(unescape_newlines(r"4a\\nb"), r"4a\nb");
        assert_eq!(unescape_newlines(r"a\\\nb"), r"a\\nb");
        assert_eq!(unescape_newlines(r"a\\b"), r"a\\b");
        assert_eq!(unescape_newlines(r"tail\"), r"tail\");
    }
}
