//! Sensor authentication against the configured allow-list
//!
//! A sensor identifies itself with the `sensor_id` query parameter and proves
//! it with the shared secret in the `X-Auth-Sensor-Token` header. Rejections
//! happen before the WebSocket upgrade.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ctg_core::DeviceId;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::SensorEntity;

pub const SENSOR_TOKEN_HEADER: &str = "x-auth-sensor-token";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("sensor_id required")]
    MissingSensorId,
    #[error("unknown sensor {0}")]
    UnknownSensor(String),
    #[error("invalid token")]
    InvalidToken,
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingSensorId => StatusCode::BAD_REQUEST,
            AuthError::UnknownSensor(_) => StatusCode::FORBIDDEN,
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AuthError::MissingSensorId => "SENSOR_ID_REQUIRED",
            AuthError::UnknownSensor(_) => "UNKNOWN_SENSOR",
            AuthError::InvalidToken => "INVALID_TOKEN",
        }
    }
}

/// Error response for authentication failures
#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = AuthErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Static device id to shared secret table
#[derive(Debug, Clone, Default)]
pub struct DeviceAllowlist {
    tokens: HashMap<DeviceId, String>,
}

impl DeviceAllowlist {
    pub fn from_entities(entities: &[SensorEntity]) -> Self {
        Self {
            tokens: entities
                .iter()
                .map(|e| (DeviceId::new(e.id.clone()), e.token.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check a claimed identity and its credential
    pub fn authenticate(
        &self,
        sensor_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<DeviceId, AuthError> {
        let sensor_id = sensor_id
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingSensorId)?;
        let device_id = DeviceId::new(sensor_id);

        let expected = self
            .tokens
            .get(&device_id)
            .ok_or_else(|| AuthError::UnknownSensor(sensor_id.to_string()))?;

        if token != Some(expected.as_str()) {
            return Err(AuthError::InvalidToken);
        }
        Ok(device_id)
    }
}
