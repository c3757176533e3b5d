//! Relay to the inference service
//!
//! One outbound WebSocket is kept alive for the life of the process:
//! 1. Dial the configured URL, retrying after a fixed backoff on failure
//! 2. Park the write half behind a mutex for [`InferenceRelay::send`]
//! 3. Read results from the peer and hand them to the observer broadcaster
//! 4. On any read or write failure, drop the link and go back to step 1
//!
//! Readings sent while the link is down are dropped, not queued.

use ctg_core::Reading;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::observers::{ObserverBroadcaster, Payload};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to connect to inference service at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("Failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to send to inference service: {0}")]
    Send(#[source] tungstenite::Error),
}

/// Inference link configuration
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// WebSocket URL of the inference service
    pub url: String,
    /// Delay between connection attempts
    pub reconnect_backoff: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/ctg".to_string(),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Counters exposed through the status API
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RelayStats {
    pub connected: bool,
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

pub struct InferenceRelay {
    config: InferenceConfig,
    link: Mutex<Option<SplitSink<WsStream, Message>>>,
    link_lost: Notify,
    observers: Arc<ObserverBroadcaster>,
    sent: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
}

impl InferenceRelay {
    pub fn new(config: InferenceConfig, observers: Arc<ObserverBroadcaster>) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            link_lost: Notify::new(),
            observers,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connected: self.is_connected().await,
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Keep the link alive forever
    pub async fn run(&self) {
        info!(url = %self.config.url, "Inference relay started");
        loop {
            // Armed before the sink is published so a failed send always wakes the receive loop
            let lost = self.link_lost.notified();
            match self.connect().await {
                Ok(stream) => {
                    info!(url = %self.config.url, "Connected to inference service");
                    self.receive(stream, lost).await;
                    warn!("Inference service connection lost, reconnecting");
                }
                Err(e) => {
                    error!(error = %e, "Inference service unavailable");
                }
            }
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn connect(&self) -> Result<SplitStream<WsStream>, RelayError> {
        let (ws, _response) =
            connect_async(self.config.url.as_str())
                .await
                .map_err(|source| RelayError::Connect {
                    url: self.config.url.clone(),
                    source,
                })?;
        let (sink, stream) = ws.split();
        *self.link.lock().await = Some(sink);
        Ok(stream)
    }

    /// Forward peer messages to observers until the link fails
    async fn receive(&self, mut stream: SplitStream<WsStream>, lost: Notified<'_>) {
        tokio::pin!(lost);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let payload = match msg {
                        Some(Ok(Message::Text(text))) => Payload::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(bytes))) => Payload::Binary(bytes.to_vec()),
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "Inference service closed the connection");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(error = %e, "Error reading from inference service");
                            break;
                        }
                        None => break,
                    };
                    self.received.fetch_add(1, Ordering::Relaxed);
                    debug!(bytes = payload.len(), "Received inference result");
                    self.observers.enqueue(payload);
                }
                _ = &mut lost => {
                    debug!("Link dropped by sender");
                    break;
                }
            }
        }

        if let Some(mut sink) = self.link.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    /// Forward a reading if the link is up.
    ///
    /// Never fails: a missing link or a write error drops the reading, and a
    /// write error also tears the link down so it gets re-established.
    pub async fn send(&self, reading: &Reading) -> bool {
        let mut link = self.link.lock().await;
        let Some(sink) = link.as_mut() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(sensor_id = %reading.device_id, "Inference service not connected, reading dropped");
            return false;
        };

        let result = match serde_json::to_string(reading) {
            Ok(json) => sink.send(Message::Text(json.into())).await.map_err(RelayError::Send),
            Err(e) => Err(RelayError::from(e)),
        };

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(sensor_id = %reading.device_id, "Sent reading to inference service");
                true
            }
            Err(e @ RelayError::Encode(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Reading dropped");
                false
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Reading dropped, resetting inference link");
                self.reset_link(&mut link);
                false
            }
        }
    }

    /// Drop the write half and wake the receive loop so the link is re-dialed
    fn reset_link(&self, link: &mut Option<SplitSink<WsStream, Message>>) {
        *link = None;
        self.link_lost.notify_waiters();
    }
}
