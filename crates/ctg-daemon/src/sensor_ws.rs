//! WebSocket endpoint for bedside sensors
//!
//! Per connection:
//! 1. Authenticate against the allow-list (rejected before upgrade)
//! 2. Register in the hub, opening an examination if this is the first sensor
//! 3. Run every message through the reading pipeline until the socket closes
//! 4. Unregister, closing the examination if this was the last sensor

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use ctg_core::DeviceId;
use ctg_relay::SensorConnection;
use futures_util::SinkExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::auth::SENSOR_TOKEN_HEADER;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SensorQuery {
    sensor_id: Option<String>,
}

/// WebSocket upgrade handler for sensors
pub async fn sensor_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SensorQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = headers
        .get(SENSOR_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    let device_id = match state
        .allowlist
        .authenticate(query.sensor_id.as_deref(), token)
    {
        Ok(id) => id,
        Err(e) => {
            warn!(sensor_id = ?query.sensor_id, error = %e, "Sensor rejected");
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, device_id, state))
}

async fn handle_socket(mut socket: WebSocket, device_id: DeviceId, state: Arc<AppState>) {
    let conn = SensorConnection::new(device_id);
    let span = conn.span.clone();

    async move {
        match state.sessions.attach(conn.clone()).await {
            Ok(attached) => info!(total_clients = attached.connected, "Sensor connected"),
            Err(e) => {
                error!(error = %e, "Failed to open examination, closing sensor connection");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: "examination unavailable".into(),
                    })))
                    .await;
                return;
            }
        }

        loop {
            tokio::select! {
                _ = conn.closed() => {
                    info!("Superseded by a newer connection from the same sensor");
                    break;
                }
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            state.pipeline.ingest(&conn.device_id, text.as_str().as_bytes()).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            state.pipeline.ingest(&conn.device_id, &bytes).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(error = %e, "Sensor connection closed unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        // Already closed by the peer in the common case
        let _ = socket.close().await;

        let detached = state.sessions.detach(&conn).await;
        info!(remaining_clients = detached.remaining, "Sensor disconnected");
    }
    .instrument(span)
    .await
}
