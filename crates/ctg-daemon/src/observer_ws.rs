//! WebSocket endpoint for observers of inference results

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use ctg_relay::Payload;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;

/// WebSocket upgrade handler for observers
pub async fn observer_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.config.observers.client_buffer.max(1));
    let id = state.observers.register(tx).await;

    loop {
        tokio::select! {
            // Forward queued results to the client
            payload = rx.recv() => {
                let msg = match payload {
                    Some(Payload::Text(text)) => Message::Text(text.into()),
                    Some(Payload::Binary(bytes)) => Message::Binary(bytes.into()),
                    None => break,
                };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }

            // Observers only talk back for keepalive
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping"
                            && sender.send(Message::Text("pong".into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(observer = %id, error = %e, "Observer WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Closing the channel releases a delivery waiting on this observer
    drop(rx);
    state.observers.unregister(id).await;
    debug!(observer = %id, "Observer handler finished");
}
