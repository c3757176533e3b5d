//! Examinations and the repository the relay persists through

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::reading::Reading;

pub type ExaminationId = u64;

/// Rows kept by [`MemoryExamRepository`] unless configured otherwise (a day at 1 Hz)
pub const DEFAULT_RETAINED_ROWS: usize = 86_400;

/// A monitoring session grouping a contiguous span of readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Examination {
    pub id: ExaminationId,
    pub start_time: DateTime<Utc>,
    /// `None` while the examination is open
    pub end_time: Option<DateTime<Utc>>,
}

impl Examination {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// A persisted reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtgRow {
    pub examination_id: ExaminationId,
    pub reading: Reading,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("No open examination, create one first")]
    NoOpenExamination,
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Storage contract for examinations and CTG rows
#[async_trait]
pub trait ExamRepository: Send + Sync {
    /// Return the open examination, creating one if none is open
    async fn create_examination_if_needed(&self) -> Result<Examination, RepositoryError>;

    /// Store a reading against the open examination
    async fn append_reading(&self, reading: &Reading) -> Result<(), RepositoryError>;

    /// Set the end time of the open examination.
    ///
    /// Returns `None` when nothing was open.
    async fn close_open_examination(&self) -> Result<Option<Examination>, RepositoryError>;

    async fn is_examination_open(&self) -> Result<bool, RepositoryError>;

    /// Latest examination, open or not
    async fn current_examination(&self) -> Result<Option<Examination>, RepositoryError>;
}

#[derive(Default)]
struct MemoryStore {
    examinations: Vec<Examination>,
    rows: VecDeque<CtgRow>,
}

impl MemoryStore {
    fn latest_open_mut(&mut self) -> Option<&mut Examination> {
        self.examinations.last_mut().filter(|e| e.is_open())
    }
}

/// Repository keeping examinations and the most recent rows in process memory.
///
/// Rows are held in a ring: once `retained_rows` is reached the oldest row is
/// evicted for each new one.
pub struct MemoryExamRepository {
    store: Mutex<MemoryStore>,
    retained_rows: usize,
}

impl Default for MemoryExamRepository {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_ROWS)
    }
}

impl MemoryExamRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained_rows: usize) -> Self {
        Self {
            store: Mutex::new(MemoryStore::default()),
            retained_rows: retained_rows.max(1),
        }
    }

    /// All examinations in creation order
    pub async fn examinations(&self) -> Vec<Examination> {
        self.store.lock().await.examinations.clone()
    }

    /// All persisted rows in insertion order
    pub async fn rows(&self) -> Vec<CtgRow> {
        self.store.lock().await.rows.iter().cloned().collect()
    }

    /// Rows belonging to one examination
    pub async fn rows_for(&self, id: ExaminationId) -> Vec<CtgRow> {
        self.store
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.examination_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExamRepository for MemoryExamRepository {
    async fn create_examination_if_needed(&self) -> Result<Examination, RepositoryError> {
        let mut store = self.store.lock().await;
        if let Some(open) = store.latest_open_mut() {
            debug!(examination = open.id, "Reusing open examination");
            return Ok(open.clone());
        }

        let id = store.examinations.last().map(|e| e.id + 1).unwrap_or(1);
        let examination = Examination {
            id,
            start_time: Utc::now(),
            end_time: None,
        };
        store.examinations.push(examination.clone());
        debug!(examination = id, "Created examination");
        Ok(examination)
    }

    async fn append_reading(&self, reading: &Reading) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        let examination_id = store
            .latest_open_mut()
            .map(|e| e.id)
            .ok_or(RepositoryError::NoOpenExamination)?;
        if store.rows.len() >= self.retained_rows {
            store.rows.pop_front();
        }
        store.rows.push_back(CtgRow {
            examination_id,
            reading: reading.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn close_open_examination(&self) -> Result<Option<Examination>, RepositoryError> {
        let mut store = self.store.lock().await;
        Ok(store.latest_open_mut().map(|open| {
            open.end_time = Some(Utc::now());
            open.clone()
        }))
    }

    async fn is_examination_open(&self) -> Result<bool, RepositoryError> {
        Ok(self
            .store
            .lock()
            .await
            .examinations
            .last()
            .is_some_and(Examination::is_open))
    }

    async fn current_examination(&self) -> Result<Option<Examination>, RepositoryError> {
        Ok(self.store.lock().await.examinations.last().cloned())
    }
}
