//! Examination session lifecycle driven by Hub occupancy
//!
//! The first sensor to connect opens an examination (reusing one that is
//! still open in storage), the last one to leave closes it. Every add and
//! remove on the Hub goes through [`ExaminationSessions`], which holds one
//! lock across the count check, the Hub mutation, and the storage call, so
//! the session is open exactly while the Hub is non-empty.

use ctg_core::{ExamRepository, Examination, RepositoryError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn, Instrument};

use crate::hub::{SensorConnection, SensorHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Closed,
}

/// Result of registering a sensor
#[derive(Debug)]
pub struct Attached {
    /// Hub size after registration
    pub connected: usize,
    /// Set when this connection opened (or reused) an examination
    pub opened: Option<Examination>,
}

/// Result of unregistering a sensor
#[derive(Debug)]
pub struct Detached {
    /// Hub size after removal
    pub remaining: usize,
    /// False when a newer connection for the same device had replaced this one
    pub removed: bool,
    /// Set when this was the last connection and an open examination was closed
    pub closed: Option<Examination>,
}

/// Owns the Open/Closed state machine
pub struct ExaminationSessions {
    hub: Arc<SensorHub>,
    repo: Arc<dyn ExamRepository>,
    state: Mutex<SessionState>,
}

impl ExaminationSessions {
    pub fn new(hub: Arc<SensorHub>, repo: Arc<dyn ExamRepository>) -> Self {
        Self {
            hub,
            repo,
            state: Mutex::new(SessionState::Closed),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == SessionState::Open
    }

    /// Register a sensor, opening an examination if it is the first one.
    ///
    /// If the examination cannot be opened the connection is not registered.
    /// A connection it replaces is asked to close.
    pub async fn attach(&self, conn: SensorConnection) -> Result<Attached, RepositoryError> {
        let span = conn.span.clone();
        async move {
            let mut state = self.state.lock().await;

            let mut opened = None;
            if self.hub.count().await == 0 {
                let examination = self.repo.create_examination_if_needed().await?;
                info!(examination = examination.id, "Examination open");
                opened = Some(examination);
            }

            if let Some(replaced) = self.hub.add(conn).await {
                warn!(
                    replaced = %replaced.connection_id,
                    "Device reconnected, closing superseded connection"
                );
                replaced.request_close();
            }
            *state = SessionState::Open;

            Ok::<_, RepositoryError>(Attached {
                connected: self.hub.count().await,
                opened,
            })
        }
        .instrument(span)
        .await
    }

    /// Unregister a sensor, closing the examination if it was the last one.
    ///
    /// Storage failures while closing are logged, never returned.
    pub async fn detach(&self, conn: &SensorConnection) -> Detached {
        async {
            let mut state = self.state.lock().await;

            let removed = self.hub.remove(&conn.device_id, conn.connection_id).await;
            let remaining = self.hub.count().await;

            let mut closed = None;
            if remaining == 0 && *state == SessionState::Open {
                *state = SessionState::Closed;
                match self.repo.close_open_examination().await {
                    Ok(Some(examination)) => {
                        info!(examination = examination.id, "Examination closed, no sensors remaining");
                        closed = Some(examination);
                    }
                    Ok(None) => info!("No open examination to close"),
                    Err(e) => error!(error = %e, "Failed to close examination"),
                }
            }

            Detached {
                remaining,
                removed,
                closed,
            }
        }
        .instrument(conn.span.clone())
        .await
    }
}
