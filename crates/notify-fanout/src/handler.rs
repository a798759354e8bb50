//! HTTP handlers for the gateway

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use governor::RateLimiter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::ClientIdentity;
use crate::connection::{Connection, ConnectionHandle, Payload};
use crate::gateway::{GatewayLimits, MIN_INTERVAL};
use crate::manager::ConnectionManager;
use crate::transport::PubSubTransport;

/// Shared state for handlers
#[derive(Clone)]
pub struct GatewayState {
    pub connection_manager: ConnectionManager,
    pub transport: PubSubTransport,
    pub limits: Arc<GatewayLimits>,
    /// Cancelled once the gateway stops accepting upgrades
    pub draining: CancellationToken,
}

/// WebSocket upgrade endpoint
pub async fn ws_connect(
    State(state): State<GatewayState>,
    identity: Option<Extension<ClientIdentity>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.draining.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.limits.origin_allowed(origin) {
        warn!(origin = ?origin, "Upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let Some(Extension(identity)) = identity else {
        warn!("Upgrade rejected: no authenticated identity");
        return (StatusCode::UNAUTHORIZED, "missing identity").into_response();
    };

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let ceiling = state.limits.protocol_frame_limit();
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| serve_connection(state, identity, socket, client_ip, user_agent))
}

async fn serve_connection(
    state: GatewayState,
    identity: ClientIdentity,
    socket: WebSocket,
    client_ip: Option<String>,
    user_agent: Option<String>,
) {
    let (connection, outbound) = Connection::new(
        identity.user_id,
        identity.role,
        state.limits.buffer_capacity,
    );
    let connection = connection.with_metadata(client_ip.clone(), user_agent);
    let handle = connection.handle();

    if !state.connection_manager.register(connection).await {
        debug!(connection_id = %handle.id, "Manager stopped, dropping new connection");
        return;
    }
    info!(
        connection_id = %handle.id,
        user_id = %handle.user_id,
        role = %handle.role,
        client_ip = ?client_ip,
        "Client connected"
    );

    let (sink, stream) = socket.split();
    let (close_tx, close_rx) = oneshot::channel();
    let writer_stopped = CancellationToken::new();

    let writer = tokio::spawn(write_pump(
        sink,
        outbound,
        close_rx,
        handle.clone(),
        state.limits.clone(),
        state.connection_manager.clone(),
        writer_stopped.clone(),
    ));

    let close = read_pump(
        stream,
        &handle,
        &state.limits,
        &state.connection_manager,
        &writer_stopped,
    )
    .await;
    match close {
        Some(frame) => {
            let _ = close_tx.send(frame);
        }
        None => drop(close_tx),
    }

    if let Err(e) = writer.await {
        warn!(connection_id = %handle.id, error = %e, "Write pump failed");
    }
    state.connection_manager.unregister(&handle.id).await;
    info!(connection_id = %handle.id, user_id = %handle.user_id, "Client disconnected");
}

/// Flush the outbound buffer to the socket and keep the peer alive with pings
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Payload>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
    handle: ConnectionHandle,
    limits: Arc<GatewayLimits>,
    manager: ConnectionManager,
    stopped: CancellationToken,
) {
    let stop_reader = stopped.drop_guard();
    let period = limits.ping_interval.max(MIN_INTERVAL);
    let write_timeout = limits.write_timeout.max(MIN_INTERVAL);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    let close = loop {
        let frame = tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload.to_string().into()),
                // Unregistered, dropped as a slow consumer, or manager stopped
                None => break Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: Utf8Bytes::from_static("connection closed by server"),
                }),
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
            frame = &mut close_rx => break frame.ok(),
        };

        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => handle.touch(),
            Ok(Err(e)) => {
                debug!(connection_id = %handle.id, error = %e, "Write failed");
                manager.record_error();
                break None;
            }
            Err(_) => {
                warn!(connection_id = %handle.id, "Write deadline exceeded");
                manager.record_error();
                break None;
            }
        }
    };

    drop(stop_reader);
    if let Some(frame) = close {
        let _ = timeout(write_timeout, sink.send(Message::Close(Some(frame)))).await;
    }
    let _ = timeout(write_timeout, sink.close()).await;
}

/// Read control frames until the peer leaves or breaks a limit.
///
/// Returns the close frame to send when the connection is closed for a
/// protocol violation.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    limits: &GatewayLimits,
    manager: &ConnectionManager,
    writer_stopped: &CancellationToken,
) -> Option<CloseFrame> {
    let limiter = RateLimiter::direct(limits.quota());
    let read_deadline = limits.pong_timeout.max(MIN_INTERVAL);

    loop {
        let next = tokio::select! {
            _ = writer_stopped.cancelled() => return None,
            next = timeout(read_deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                info!(connection_id = %handle.id, "Read deadline exceeded");
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %handle.id, error = %e, "Read failed");
                manager.record_error();
                return None;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        handle.touch();

        if limiter.check().is_err() {
            warn!(connection_id = %handle.id, user_id = %handle.user_id, "Inbound rate limit exceeded");
            manager.record_error();
            return Some(CloseFrame {
                code: close_code::POLICY,
                reason: Utf8Bytes::from_static("rate limit exceeded"),
            });
        }

        let size = match &msg {
            Message::Close(_) => return None,
            // Pings are answered by the protocol layer; pongs only renew the deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Text(text) => text.as_str().len(),
            Message::Binary(data) => data.len(),
        };

        if size > limits.max_message_size {
            warn!(connection_id = %handle.id, size, "Inbound frame too large");
            manager.record_error();
            return Some(CloseFrame {
                code: close_code::SIZE,
                reason: Utf8Bytes::from_static("message too large"),
            });
        }
        manager.record_received();
        debug!(connection_id = %handle.id, size, "Ignoring client data frame");
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub active_connections: usize,
    pub pubsub_active: bool,
}

pub async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let pubsub_active = state.transport.is_active().await;
    let status = if pubsub_active { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        active_connections: state.connection_manager.connection_count(),
        pubsub_active,
    })
}

pub async fn ready(State(state): State<GatewayState>) -> impl IntoResponse {
    if state.draining.is_cancelled() || !state.transport.is_active().await {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

pub async fn metrics(State(state): State<GatewayState>) -> Response {
    match state.connection_manager.render_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.connection_manager.metrics_content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
