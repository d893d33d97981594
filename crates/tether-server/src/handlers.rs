//! Connection handlers for the Tether server.
//!
//! This module validates handshakes, builds transports through the factory
//! and drives each connection's session loop.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tether_parser::{Packet, PacketData, PacketOptions, PacketType, Version, PROTOCOL_VERSION};
use tether_transport::{
    available_upgrades, create_transport, AxumSocket, Transport, TransportEvent, TransportKind,
    TransportRequest, TransportVariant,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Transports clients may connect with.
    pub enabled: Vec<TransportKind>,
    /// Connected clients by session id, with their connection time.
    pub clients: DashMap<String, Instant>,
    next_id: AtomicU64,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration names an unknown transport.
    pub fn new(config: Config) -> Result<Self> {
        let enabled = config.enabled_transports()?;
        Ok(Self {
            config,
            enabled,
            clients: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Generate a session id unique to this process.
    fn generate_sid(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{:x}{:04x}", nanos, seq & 0xffff)
    }
}

/// Reasons a handshake is refused, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    UnknownTransport,
    UnknownSid,
    BadRequest,
    UnsupportedProtocolVersion,
}

impl HandshakeError {
    /// Numeric code sent to the client.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            HandshakeError::UnknownTransport => 0,
            HandshakeError::UnknownSid => 1,
            HandshakeError::BadRequest => 3,
            HandshakeError::UnsupportedProtocolVersion => 5,
        }
    }

    /// Human readable message sent to the client.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            HandshakeError::UnknownTransport => "Transport unknown",
            HandshakeError::UnknownSid => "Session ID unknown",
            HandshakeError::BadRequest => "Bad request",
            HandshakeError::UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            HandshakeError::UnknownTransport => "unknown_transport",
            HandshakeError::UnknownSid => "unknown_sid",
            HandshakeError::BadRequest => "bad_request",
            HandshakeError::UnsupportedProtocolVersion => "unsupported_version",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u8,
    message: &'static str,
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.message(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Contents of the open packet.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Handshake<'a> {
    sid: &'a str,
    upgrades: Vec<&'static str>,
    ping_interval: u64,
    ping_timeout: u64,
    max_payload: usize,
}

/// Check a handshake's query and pick the transport it asks for.
///
/// # Errors
///
/// Returns the reason the handshake is refused.
pub fn validate_handshake(
    query: &HashMap<String, String>,
    enabled: &[TransportKind],
) -> Result<TransportKind, HandshakeError> {
    let version = query
        .get("EIO")
        .and_then(|v| v.parse::<Version>().ok())
        .ok_or(HandshakeError::UnsupportedProtocolVersion)?;
    if !version.is_compatible_with(&PROTOCOL_VERSION) {
        return Err(HandshakeError::UnsupportedProtocolVersion);
    }

    let kind = query
        .get("transport")
        .and_then(|name| name.parse::<TransportKind>().ok())
        .filter(|kind| enabled.contains(kind))
        .ok_or(HandshakeError::UnknownTransport)?;

    // Sessions live only as long as their WebSocket, so there is nothing to resume
    if query.contains_key("sid") {
        return Err(HandshakeError::UnknownSid);
    }

    Ok(kind)
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.path, get(engine_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let path = config.transport.path.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(config)?);
    let enabled: Vec<&str> = state.enabled.iter().map(|kind| kind.as_str()).collect();

    let listener = TcpListener::bind(addr).await?;

    info!("Tether server listening on {}", addr);
    info!(transports = ?enabled, "Endpoint: ws://{}{}", addr, path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.clients.len(),
    }))
}

/// Handshake handler.
async fn engine_handler(
    Query(query): Query<HashMap<String, String>>,
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let kind = match validate_handshake(&query, &state.enabled) {
        Ok(kind) => kind,
        Err(e) => {
            debug!(code = e.code(), "Handshake refused: {}", e.message());
            metrics::record_rejected(e.reason());
            return e.into_response();
        }
    };

    // Polling and WebTransport need a session layer this server does not host
    let Some(ws) = ws.filter(|_| kind == TransportKind::WebSocket) else {
        debug!(transport = %kind, "Handshake refused: not a WebSocket upgrade");
        metrics::record_rejected(HandshakeError::BadRequest.reason());
        return HandshakeError::BadRequest.into_response();
    };

    ws.max_message_size(state.config.limits.max_payload)
        .on_upgrade(move |socket| {
            let request = TransportRequest::from_query(query)
                .with_upgraded_socket(Box::new(AxumSocket::new(socket)));
            handle_connection(request, state)
        })
}

fn payload_len(packet: &Packet) -> usize {
    match &packet.data {
        Some(PacketData::Text(text)) => text.len(),
        Some(PacketData::Binary(data)) => data.len(),
        None => 0,
    }
}

/// Packets waiting for the transport to become writable, bounded by the
/// total payload size they may hold.
struct Outbox {
    queue: VecDeque<Packet>,
    bytes: usize,
    limit: usize,
}

impl Outbox {
    fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Queue a packet. Returns `false`, leaving the queue untouched, when it
    /// would exceed the limit. Empty packets count as one byte.
    #[must_use]
    fn push(&mut self, packet: Packet) -> bool {
        let len = payload_len(&packet).max(1);
        if self.bytes + len > self.limit {
            return false;
        }
        self.bytes += len;
        self.queue.push_back(packet);
        true
    }

    fn flush(&mut self, transport: &mut TransportVariant) {
        if self.queue.is_empty() || !transport.writable() {
            return;
        }
        let batch: Vec<Packet> = self.queue.drain(..).collect();
        self.bytes = 0;
        for packet in &batch {
            metrics::record_packet(payload_len(packet), "outbound");
        }
        transport.send(batch);
    }
}

/// Handle one connection from handshake to close.
async fn handle_connection(request: TransportRequest, state: Arc<AppState>) {
    let mut transport = match create_transport(TransportKind::WebSocket, request) {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, "Failed to create transport");
            return;
        }
    };
    transport.set_per_message_deflate(state.config.per_message_deflate());

    let Some(mut events) = transport.take_events() else {
        error!("Transport events already taken");
        return;
    };

    let sid = state.generate_sid();
    let heartbeat = &state.config.heartbeat;
    let ping_interval = Duration::from_millis(heartbeat.ping_interval_ms);
    let ping_timeout = Duration::from_millis(heartbeat.ping_timeout_ms);

    let handshake = Handshake {
        sid: &sid,
        upgrades: available_upgrades(transport.kind(), &state.enabled)
            .into_iter()
            .map(TransportKind::as_str)
            .collect(),
        ping_interval: heartbeat.ping_interval_ms,
        ping_timeout: heartbeat.ping_timeout_ms,
        max_payload: state.config.limits.max_payload,
    };
    let handshake = match serde_json::to_string(&handshake) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to encode handshake");
            transport.close(None);
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new(transport.name());
    state.clients.insert(sid.clone(), Instant::now());
    debug!(sid = %sid, transport = transport.name(), "Client connected");

    let mut outbox = Outbox::new(state.config.limits.max_payload);
    if outbox.push(Packet::open(handshake)) {
        outbox.flush(&mut transport);
    } else {
        error!(sid = %sid, "Handshake larger than max_payload");
        transport.close(None);
        state.clients.remove(&sid);
        return;
    }

    let mut ping_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    let pong_deadline = tokio::time::sleep(ping_interval + ping_timeout);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Packet(packet)) => {
                    metrics::record_packet(payload_len(&packet), "inbound");
                    let reply = match packet.packet_type {
                        PacketType::Message => Some(Packet {
                            options: Some(PacketOptions::default().with_compress(true)),
                            ..packet
                        }),
                        PacketType::Pong => {
                            pong_deadline
                                .as_mut()
                                .reset(tokio::time::Instant::now() + ping_interval + ping_timeout);
                            None
                        }
                        PacketType::Ping => Some(match packet.data {
                            Some(data) => Packet::with_data(PacketType::Pong, data),
                            None => Packet::pong(),
                        }),
                        PacketType::Close => {
                            debug!(sid = %sid, "Client sent close");
                            break;
                        }
                        other => {
                            debug!(sid = %sid, packet_type = %other, "Ignoring packet");
                            None
                        }
                    };
                    if let Some(reply) = reply {
                        if !outbox.push(reply) {
                            warn!(sid = %sid, "Outbound buffer full, closing");
                            break;
                        }
                    }
                    outbox.flush(&mut transport);
                }
                Some(TransportEvent::Drain) => outbox.flush(&mut transport),
                Some(TransportEvent::Error(e)) => {
                    warn!(sid = %sid, error = %e, "Transport error");
                    metrics::record_transport_error(transport.name());
                    break;
                }
                Some(TransportEvent::Close) | None => {
                    debug!(sid = %sid, "Transport closed");
                    break;
                }
            },
            _ = ping_timer.tick() => {
                if !outbox.push(Packet::ping()) {
                    warn!(sid = %sid, "Outbound buffer full, closing");
                    break;
                }
                outbox.flush(&mut transport);
            }
            () = &mut pong_deadline => {
                debug!(sid = %sid, "Ping timeout");
                break;
            }
        }
    }

    transport.close(None);
    state.clients.remove(&sid);
    debug!(sid = %sid, "Client disconnected");
}
