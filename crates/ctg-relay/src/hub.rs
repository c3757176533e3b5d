//! Registry of live sensor connections

use ctg_core::DeviceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{info_span, Span};
use uuid::Uuid;

/// A registered sensor connection
///
/// The WebSocket itself stays with the task serving it; the Hub holds the
/// identity, the logging span, and the signal used to ask that task to close.
#[derive(Debug, Clone)]
pub struct SensorConnection {
    pub device_id: DeviceId,
    /// Distinguishes two connections claiming the same device id
    pub connection_id: Uuid,
    pub span: Span,
    close: Arc<Notify>,
}

impl SensorConnection {
    pub fn new(device_id: DeviceId) -> Self {
        let connection_id = Uuid::new_v4();
        let span = info_span!("sensor", sensor_id = %device_id, conn = %connection_id);
        Self {
            device_id,
            connection_id,
            span,
            close: Arc::new(Notify::new()),
        }
    }

    /// Ask the task serving this connection to shut it down
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called
    pub async fn closed(&self) {
        self.close.notified().await
    }
}

/// Device id to connection map
#[derive(Default)]
pub struct SensorHub {
    connections: RwLock<HashMap<DeviceId, SensorConnection>>,
}

impl SensorHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced (last write wins)
    pub async fn add(&self, conn: SensorConnection) -> Option<SensorConnection> {
        let mut connections = self.connections.write().await;
        connections.insert(conn.device_id.clone(), conn)
    }

    /// Remove the entry for `device_id` if it still belongs to `connection_id`
    pub async fn remove(&self, device_id: &DeviceId, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(device_id) {
            Some(conn) if conn.connection_id == connection_id => {
                connections.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, device_id: &DeviceId) -> bool {
        self.connections.read().await.contains_key(device_id)
    }

    /// Connected device ids, sorted
    pub async fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
