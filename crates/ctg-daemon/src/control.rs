//! Sensor power control over each sensor's HTTP API
//!
//! Sensors expose `GET /api/on` and `GET /api/off`. Sensors are started one
//! at a time in configuration order and stopped all together.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SensorEntity;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("all sensors are already started")]
    AllStarted,
    #[error("sensor {0} has no address configured")]
    NoAddress(String),
    #[error("failed to reach sensor {id}: {source}")]
    Request {
        id: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("sensor {id} returned status {status}")]
    Status { id: String, status: u16 },
    #[error("failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct ControlErrorBody {
    error: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::AllStarted | ControlError::NoAddress(_) => StatusCode::BAD_REQUEST,
            ControlError::Request { .. } | ControlError::Status { .. } => StatusCode::BAD_GATEWAY,
            ControlError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ControlErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Sensor reported by the start endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub id: String,
    pub ip: String,
    pub connected: bool,
}

pub struct SensorControl {
    client: reqwest::Client,
    sensors: Vec<SensorEntity>,
    /// Number of sensors started so far, in configuration order
    started: Mutex<usize>,
}

impl SensorControl {
    pub fn new(sensors: Vec<SensorEntity>) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            sensors,
            started: Mutex::new(0),
        })
    }

    pub async fn started(&self) -> usize {
        *self.started.lock().await
    }

    /// Power on the next configured sensor
    pub async fn start_next(&self) -> Result<SensorStatus, ControlError> {
        let mut started = self.started.lock().await;
        let sensor = self
            .sensors
            .get(*started)
            .ok_or(ControlError::AllStarted)?;
        let ip = sensor
            .ip
            .clone()
            .ok_or_else(|| ControlError::NoAddress(sensor.id.clone()))?;

        self.call(sensor, &ip, "on").await?;
        *started += 1;

        info!(sensor_id = %sensor.id, ip = %ip, index = *started, "Sensor started");
        Ok(SensorStatus {
            id: sensor.id.clone(),
            ip,
            connected: true,
        })
    }

    /// Power off every started sensor; failures are logged and skipped.
    ///
    /// Returns how many sensors acknowledged.
    pub async fn stop_all(&self) -> usize {
        let mut started = self.started.lock().await;
        if *started == 0 {
            info!("No active sensors to stop");
            return 0;
        }

        let mut stopped = 0;
        for sensor in &self.sensors[..*started] {
            let Some(ip) = sensor.ip.as_deref() else {
                warn!(sensor_id = %sensor.id, "Sensor has no address, skipping stop");
                continue;
            };
            match self.call(sensor, ip, "off").await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(sensor_id = %sensor.id, error = %e, "Failed to stop sensor"),
            }
        }
        *started = 0;

        info!(stopped_count = stopped, "All sensors stopped");
        stopped
    }

    async fn call(&self, sensor: &SensorEntity, ip: &str, action: &str) -> Result<(), ControlError> {
        let url = format!("http://{}/api/{}", ip, action);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ControlError::Request {
                id: sensor.id.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ControlError::Status {
                id: sensor.id.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeSensor {
        on: AtomicUsize,
        off: AtomicUsize,
    }

    async fn spawn_fake_sensor() -> (String, Arc<FakeSensor>) {
        let sensor = Arc::new(FakeSensor::default());
        let app = Router::new()
            .route(
                "/api/on",
                get(|State(s): State<Arc<FakeSensor>>| async move {
                    s.on.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }),
            )
            .route(
                "/api/off",
                get(|State(s): State<Arc<FakeSensor>>| async move {
                    s.off.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }),
            )
            .with_state(sensor.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), sensor)
    }

    fn entity(id: &str, ip: Option<String>) -> SensorEntity {
        SensorEntity {
            id: id.into(),
            token: "t".into(),
            ip,
        }
    }

    #[tokio::test]
    async fn test_start_in_order_then_stop_all() {
        let (addr, fake) = spawn_fake_sensor().await;
        let control = SensorControl::new(vec![
            entity("s1", Some(addr.clone())),
            entity("s2", Some(addr.clone())),
        ])
        .unwrap();

        assert_eq!(control.start_next().await.unwrap().id, "s1");
        assert_eq!(control.start_next().await.unwrap().id, "s2");
        assert!(matches!(
            control.start_next().await,
            Err(ControlError::AllStarted)
        ));
        assert_eq!(fake.on.load(Ordering::SeqCst), 2);

        assert_eq!(control.stop_all().await, 2);
        assert_eq!(fake.off.load(Ordering::SeqCst), 2);
        assert_eq!(control.started().await, 0);
        assert_eq!(control.stop_all().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_sensor_does_not_advance() {
        let control = SensorControl::new(vec![entity("s1", Some("127.0.0.1:9".into()))]).unwrap();
        assert!(matches!(
            control.start_next().await,
            Err(ControlError::Request { .. })
        ));
        assert_eq!(control.started().await, 0);

        let control = SensorControl::new(vec![entity("s1", None)]).unwrap();
        assert!(matches!(
            control.start_next().await,
            Err(ControlError::NoAddress(_))
        ));
    }
}
