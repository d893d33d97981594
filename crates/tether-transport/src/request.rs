//! The incoming request a transport is built from.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::socket::{SocketAdapter, StreamAdapter};

/// Query parameter asking for base64 instead of binary payloads.
pub const BASE64_PARAM: &str = "b64";

/// Query parameter carrying the JSONP callback index.
pub const JSONP_PARAM: &str = "j";

/// An incoming connection request, as seen by the transport factory.
///
/// Besides the query, a request may carry the channel a transport will sit
/// on: an upgraded socket for WebSocket, or a byte stream for WebTransport.
/// Transports take ownership of these when they are built.
#[derive(Default)]
pub struct TransportRequest {
    query: HashMap<String, String>,
    upgraded_socket: Option<Box<dyn SocketAdapter>>,
    stream: Option<Box<dyn StreamAdapter>>,
    remote_addr: Option<SocketAddr>,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("query", &self.query)
            .field("upgraded_socket", &self.upgraded_socket.is_some())
            .field("stream", &self.stream.is_some())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl TransportRequest {
    /// Create an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request from parsed query parameters.
    #[must_use]
    pub fn from_query(query: HashMap<String, String>) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Attach an upgraded socket.
    #[must_use]
    pub fn with_upgraded_socket(mut self, socket: Box<dyn SocketAdapter>) -> Self {
        self.upgraded_socket = Some(socket);
        self
    }

    /// Attach a byte stream.
    #[must_use]
    pub fn with_stream(mut self, stream: Box<dyn StreamAdapter>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Look up a query parameter.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Whether the client accepts binary payloads as-is.
    #[must_use]
    pub fn supports_binary(&self) -> bool {
        !self.query.contains_key(BASE64_PARAM)
    }

    /// The peer address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Take the upgraded socket out of the request.
    pub fn take_upgraded_socket(&mut self) -> Option<Box<dyn SocketAdapter>> {
        self.upgraded_socket.take()
    }

    /// Take the byte stream out of the request.
    pub fn take_stream(&mut self) -> Option<Box<dyn StreamAdapter>> {
        self.stream.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_lookup() {
        let request = TransportRequest::new()
            .with_query("transport", "polling")
            .with_query(JSONP_PARAM, "3");

        assert_eq!(request.query("transport"), Some("polling"));
        assert_eq!(request.query(JSONP_PARAM), Some("3"));
        assert_eq!(request.query("sid"), None);
        assert!(request.supports_binary());
    }

    #[test]
    fn test_base64_disables_binary() {
        let request = TransportRequest::new().with_query(BASE64_PARAM, "1");
        assert!(!request.supports_binary());
    }
}
