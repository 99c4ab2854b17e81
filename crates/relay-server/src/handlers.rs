//! Connection handlers for Relay server.
//!
//! This module handles the connection lifecycle and message processing.

use crate::config::{Config, MalformedPolicy};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ProtocolError, Record, RecordCodec, WireFormat};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_core::{ChannelOutbound, ConnectionId, Outbound, Relay};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The record relay.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            relay: Relay::with_config(config.relay_config()),
            config,
        }
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    /// Outbound encoding for this connection, `json` or `msgpack`.
    format: Option<String>,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/records", get(records_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "records": stats.records,
        "connections": stats.connections,
    }))
}

/// Snapshot of the live records, in insertion order.
async fn records_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Record>> {
    Json(state.relay.snapshot())
}

/// WebSocket upgrade handler.
///
/// The connection count checked here is a fast path. Concurrent upgrades can
/// all pass it, so the relay checks the limit again when the connection joins.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let format = match params.format.as_deref().map(str::parse::<WireFormat>) {
        None => state.config.transport.format,
        Some(Ok(format)) => format,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    if state.relay.connection_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Refusing connection, limit reached"
        );
        metrics::record_error("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, format))
}

/// Handle a WebSocket connection.
async fn handle_websocket(mut socket: WebSocket, state: Arc<AppState>, format: WireFormat) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let codec = RecordCodec::new(format).with_max_size(state.config.limits.max_record_size);

    // The relay owns the only sender half; eviction closes `outbound_rx`.
    // The queue has room for the whole replay on top of the live buffer.
    let buffer = state.config.limits.outbound_buffer;
    let joined = state.relay.join_with(connection_id.clone(), |pending| {
        let (outbound, rx) = ChannelOutbound::new(pending + buffer);
        (Arc::new(outbound) as Arc<dyn Outbound>, rx)
    });
    let (replay, mut outbound_rx) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Refusing connection");
            metrics::record_error("capacity");
            if let Err(e) = socket.close().await {
                debug!(connection = %connection_id, error = %e, "Close failed");
            }
            return;
        }
    };
    metrics::record_evictions(replay.evicted.len());
    if !state.relay.is_connected(&connection_id) {
        warn!(connection = %connection_id, "Evicted during replay");
        return;
    }

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    debug!(
        connection = %connection_id,
        format = %format,
        replayed = replay.delivered,
        "WebSocket connected"
    );

    let period = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Deliveries queued by the relay
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(record) => {
                        let message = match encode_record(&codec, &record) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(
                                    connection = %connection_id,
                                    record = ?record.id,
                                    error = %e,
                                    "Skipping record that cannot be encoded"
                                );
                                metrics::record_error("encode");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(message).await {
                            warn!(connection = %connection_id, error = %e, "Failed to deliver record");
                            metrics::record_error("send");
                            break;
                        }
                    }
                    None => {
                        debug!(connection = %connection_id, "Evicted by relay");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound(&state, &connection_id, &codec, text.as_bytes(), WireFormat::Json) {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !handle_inbound(&state, &connection_id, &codec, &data, WireFormat::Msgpack) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Liveness already recorded
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup: leave the relay, knowledge set goes with it
    state.relay.leave(&connection_id);
    if let Err(e) = sender.close().await {
        debug!(connection = %connection_id, error = %e, "Close failed");
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode an inbound payload and apply it.
///
/// Returns `false` if the connection should be closed.
fn handle_inbound(
    state: &AppState,
    connection_id: &ConnectionId,
    codec: &RecordCodec,
    data: &[u8],
    format: WireFormat,
) -> bool {
    metrics::record_message(data.len(), "inbound");

    let record = match codec.decode(data, format) {
        Ok(record) => record,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Malformed record");
            metrics::record_error("decode");
            return state.config.relay.on_malformed == MalformedPolicy::Drop;
        }
    };

    let start = Instant::now();
    let report = state.relay.apply(connection_id, record);
    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::record_apply(&report);
    metrics::set_active_records(state.relay.record_count());

    true
}

/// Encode a record into a WebSocket message in the codec's format.
fn encode_record(codec: &RecordCodec, record: &Record) -> Result<Message, ProtocolError> {
    let message = if codec.format().is_text() {
        let text = codec.encode_text(record)?;
        metrics::record_message(text.len(), "outbound");
        Message::Text(text)
    } else {
        let data = codec.encode(record)?;
        metrics::record_message(data.len(), "outbound");
        Message::Binary(data.to_vec())
    };
    Ok(message)
}
