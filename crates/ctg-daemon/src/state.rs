//! Application state management

use anyhow::Result;
use ctg_core::ExamRepository;
use ctg_relay::{
    ExaminationSessions, InferenceRelay, ObserverBroadcaster, ReadingPipeline, SensorHub,
};
use std::sync::Arc;
use tracing::info;

use crate::auth::DeviceAllowlist;
use crate::config::Config;
use crate::control::SensorControl;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Sensors allowed to connect
    pub allowlist: DeviceAllowlist,
    /// Live sensor connections
    pub hub: Arc<SensorHub>,
    /// Examination lifecycle driven by the hub
    pub sessions: ExaminationSessions,
    /// Examination storage
    pub repo: Arc<dyn ExamRepository>,
    /// Link to the inference service
    pub relay: Arc<InferenceRelay>,
    /// Connected observers
    pub observers: Arc<ObserverBroadcaster>,
    /// Decode, persist, forward
    pub pipeline: ReadingPipeline,
    /// Sensor power control
    pub sensor_control: SensorControl,
}

impl AppState {
    /// Create new application state.
    ///
    /// Must be called inside a Tokio runtime; starts the observer delivery task.
    /// The inference relay is started by the server.
    pub fn new(config: Config, repo: Arc<dyn ExamRepository>) -> Result<Arc<Self>> {
        let allowlist = DeviceAllowlist::from_entities(&config.sensors.entities);
        if allowlist.is_empty() {
            tracing::warn!("No sensors configured, every sensor connection will be rejected");
        }

        let hub = Arc::new(SensorHub::new());
        let sessions = ExaminationSessions::new(hub.clone(), repo.clone());

        let observers = ObserverBroadcaster::spawn(config.observers.queue_capacity);
        let relay = Arc::new(InferenceRelay::new(
            config.to_inference_config(),
            observers.clone(),
        ));

        let mut pipeline = ReadingPipeline::new(repo.clone(), relay.clone());
        if config.observers.forward_readings {
            pipeline = pipeline.with_raw_fanout(observers.clone());
        }

        let sensor_control = SensorControl::new(config.sensors.entities.clone())?;

        info!(
            sensors = allowlist.len(),
            inference = %relay.url(),
            "Application state ready"
        );

        Ok(Arc::new(Self {
            config,
            allowlist,
            hub,
            sessions,
            repo,
            relay,
            observers,
            pipeline,
            sensor_control,
        }))
    }
}
