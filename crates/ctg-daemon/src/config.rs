//! Configuration loading and environment overrides

use anyhow::Result;
use ctg_core::DEFAULT_RETAINED_ROWS;
use ctg_relay::{InferenceConfig, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub observers: ObserversConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the web server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// TLS configuration (optional - enables HTTPS when present)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tls: None,
        }
    }
}

/// TLS/HTTPS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsConfig {
    /// Upper bound on answering an upgrade request on the socket routes, from
    /// request to the 101 response. The upgraded connection is not bounded.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Sensors allowed to connect
    #[serde(default)]
    pub entities: Vec<SensorEntity>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            entities: Vec::new(),
        }
    }
}

impl SensorsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn default_handshake_timeout() -> u64 {
    10
}

/// One allowed sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntity {
    /// Device identity presented in the `sensor_id` query parameter
    pub id: String,
    /// Shared secret presented in the `X-Auth-Sensor-Token` header
    pub token: String,
    /// Host (and optional port) of the sensor's power-control API
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    /// WebSocket URL of the inference service
    #[serde(default = "default_inference_url")]
    pub url: String,
    /// Seconds to wait between connection attempts
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: u64,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            reconnect_backoff_secs: default_backoff(),
        }
    }
}

fn default_inference_url() -> String {
    "ws://127.0.0.1:8000/ws/ctg".to_string()
}

fn default_backoff() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserversConfig {
    /// Results waiting for delivery before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-observer outbound buffer
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    /// Also push raw readings to observers
    #[serde(default)]
    pub forward_readings: bool,
}

impl Default for ObserversConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            client_buffer: default_client_buffer(),
            forward_readings: false,
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_client_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Most recent CTG rows kept by the in-memory repository
    #[serde(default = "default_retained_rows")]
    pub retained_rows: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retained_rows: default_retained_rows(),
        }
    }
}

fn default_retained_rows() -> usize {
    DEFAULT_RETAINED_ROWS
}

impl Config {
    /// Convert to the relay's link configuration
    pub fn to_inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            url: self.inference.url.clone(),
            reconnect_backoff: Duration::from_secs(self.inference.reconnect_backoff_secs),
        }
    }

    /// Apply `CTG_BIND`, `CTG_INFERENCE_URL` and `SENSOR_IP_<n>` overrides
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("CTG_BIND") {
            self.daemon.bind = bind;
        }
        if let Some(url) = lookup("CTG_INFERENCE_URL") {
            self.inference.url = url;
        }
        for (i, sensor) in self.sensors.entities.iter_mut().enumerate() {
            if let Some(ip) = lookup(&format!("SENSOR_IP_{}", i + 1)) {
                sensor.ip = Some(ip);
            }
        }
    }
}

/// Load configuration from file, then apply environment overrides
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };

    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}
