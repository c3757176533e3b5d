//! REST API handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use ctg_core::Examination;
use ctg_relay::{RelayStats, SessionState};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::control::SensorStatus;
use crate::state::AppState;

pub const SERVICE_NAME: &str = "ctg-relay";

#[derive(Serialize)]
pub struct HealthInfo {
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
}

/// Liveness probe
pub async fn health() -> impl IntoResponse {
    Json(HealthInfo {
        timestamp: Utc::now(),
        service: SERVICE_NAME,
    })
}

#[derive(Serialize)]
pub struct InferenceStatus {
    pub url: String,
    #[serde(flatten)]
    pub stats: RelayStats,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub sensors: Vec<String>,
    pub sensors_started: usize,
    pub session: SessionState,
    pub examination: Option<Examination>,
    pub observers: usize,
    pub inference: InferenceStatus,
}

/// Snapshot of hub, session, observers and inference link
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let examination = match state.repo.current_examination().await {
        Ok(examination) => examination,
        Err(e) => {
            error!(error = %e, "Failed to read current examination");
            None
        }
    };

    Json(StatusResponse {
        sensors: state
            .hub
            .device_ids()
            .await
            .into_iter()
            .map(|id| id.0)
            .collect(),
        sensors_started: state.sensor_control.started().await,
        session: state.sessions.state().await,
        examination,
        observers: state.observers.count().await,
        inference: InferenceStatus {
            url: state.relay.url().to_string(),
            stats: state.relay.stats().await,
        },
    })
}

#[derive(Serialize)]
pub struct StartSensorResponse {
    pub message: &'static str,
    pub sensor: SensorStatus,
}

#[derive(Serialize)]
pub struct StopSensorsResponse {
    pub message: &'static str,
    pub stopped: usize,
}

/// Power on the next configured sensor
pub async fn start_sensor(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.sensor_control.start_next().await {
        Ok(sensor) => (
            StatusCode::OK,
            Json(StartSensorResponse {
                message: "Sensor started successfully",
                sensor,
            }),
        )
            .into_response(),
        Err(e) => {
            info!(error = %e, "Sensor start refused");
            e.into_response()
        }
    }
}

/// Power off all started sensors
pub async fn stop_sensors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.sensor_control.stop_all().await;
    Json(StopSensorsResponse {
        message: "All sensors stopped successfully",
        stopped,
    })
}
