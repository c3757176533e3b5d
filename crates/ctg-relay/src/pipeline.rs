//! Per-message processing for sensor connections
//!
//! Decode, persist, then forward. A reading that fails to persist is never
//! forwarded to inference.

use ctg_core::{DeviceId, ExamRepository, Reading, SensorMessage};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::inference::InferenceRelay;
use crate::observers::{ObserverBroadcaster, Payload};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Not a valid sensor message; skipped
    Malformed,
    /// Decoded but storage rejected it; not forwarded
    NotPersisted(Reading),
    /// Stored; `forwarded` is false if the inference link was down
    Persisted { reading: Reading, forwarded: bool },
}

pub struct ReadingPipeline {
    repo: Arc<dyn ExamRepository>,
    relay: Arc<InferenceRelay>,
    /// Also fan raw readings out to observers when set
    raw_observers: Option<Arc<ObserverBroadcaster>>,
}

impl ReadingPipeline {
    pub fn new(repo: Arc<dyn ExamRepository>, relay: Arc<InferenceRelay>) -> Self {
        Self {
            repo,
            relay,
            raw_observers: None,
        }
    }

    /// Enqueue every persisted reading to observers as JSON too
    pub fn with_raw_fanout(mut self, observers: Arc<ObserverBroadcaster>) -> Self {
        self.raw_observers = Some(observers);
        self
    }

    pub async fn ingest(&self, device_id: &DeviceId, raw: &[u8]) -> Ingested {
        let message = match SensorMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    error = %e,
                    raw_message = %String::from_utf8_lossy(raw),
                    "Failed to parse sensor message"
                );
                return Ingested::Malformed;
            }
        };

        if !message.sensor_id.is_empty() && message.sensor_id != device_id.as_str() {
            debug!(claimed = %message.sensor_id, "Payload sensor id differs from connection identity");
        }

        let reading = message.into_reading(device_id);
        info!(
            sec_from_start = reading.sec_from_start,
            bpm = reading.heart_rate_bpm,
            uterus = reading.uterine_activity,
            spasms = reading.contraction_signal,
            "Received sensor data"
        );

        if let Err(e) = self.repo.append_reading(&reading).await {
            error!(error = %e, "Failed to save CTG data");
            return Ingested::NotPersisted(reading);
        }
        debug!("CTG data saved");

        let forwarded = self.relay.send(&reading).await;

        if let Some(observers) = &self.raw_observers {
            match serde_json::to_string(&reading) {
                Ok(json) => {
                    observers.enqueue(Payload::Text(json));
                }
                Err(e) => warn!(error = %e, "Failed to encode reading for observers"),
            }
        }

        Ingested::Persisted { reading, forwarded }
    }
}
