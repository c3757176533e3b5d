//! CTG Relay - Sensor hub, examination sessions, and result fan-out
//!
//! This crate holds the concurrent core of the system:
//! - Sensor hub tracking live device connections
//! - Examination session lifecycle driven by hub occupancy
//! - Reading pipeline (decode, persist, forward)
//! - Inference relay with automatic reconnection
//! - Observer broadcaster with a bounded delivery queue

pub mod hub;
pub mod inference;
pub mod observers;
pub mod pipeline;
pub mod session;

pub use hub::{SensorConnection, SensorHub};
pub use inference::{InferenceConfig, InferenceRelay, RelayError, RelayStats};
pub use observers::{ObserverBroadcaster, ObserverId, Payload, DEFAULT_QUEUE_CAPACITY};
pub use pipeline::{Ingested, ReadingPipeline};
pub use session::{Attached, Detached, ExaminationSessions, SessionState};
