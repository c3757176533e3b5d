//! Readings and the sensor wire format
//!
//! Sensors push one JSON object per WebSocket message:
//!
//! ```json
//! {"sensorID": "s1", "secFromStart": 12.5, "data": {"BPMChild": 140, "uterus": 20, "spasms": 0}}
//! ```
//!
//! The inference peer receives the same values flattened into a [`Reading`]:
//!
//! ```json
//! {"sensorID": "s1", "secFromStart": 12.5, "BPMChild": 140.0, "uterus": 20.0, "spasms": 0.0}
//! ```

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Message as pushed by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMessage {
    /// Identity the sensor claims inside the payload
    #[serde(rename = "sensorID", default)]
    pub sensor_id: String,
    #[serde(rename = "secFromStart")]
    pub sec_from_start: f64,
    pub data: SensorData,
}

/// Physiological channels of a sensor message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    /// Fetal heart rate in beats per minute
    #[serde(rename = "BPMChild")]
    pub bpm_child: f64,
    /// Uterine activity
    pub uterus: f64,
    /// Contraction signal
    pub spasms: f64,
}

impl SensorMessage {
    /// Decode a message from raw WebSocket bytes
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Build a reading attributed to the authenticated device.
    ///
    /// The connection's identity wins over the `sensorID` field in the payload.
    pub fn into_reading(self, device_id: &DeviceId) -> Reading {
        Reading {
            device_id: device_id.clone(),
            sec_from_start: self.sec_from_start,
            heart_rate_bpm: self.data.bpm_child,
            uterine_activity: self.data.uterus,
            contraction_signal: self.data.spasms,
        }
    }
}

/// One timestamped data point from a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "sensorID")]
    pub device_id: DeviceId,
    #[serde(rename = "secFromStart")]
    pub sec_from_start: f64,
    #[serde(rename = "BPMChild")]
    pub heart_rate_bpm: f64,
    #[serde(rename = "uterus")]
    pub uterine_activity: f64,
    #[serde(rename = "spasms")]
    pub contraction_signal: f64,
}
