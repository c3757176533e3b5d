//! CTG Core - Core types, sensor wire format, and examination storage
//!
//! This crate provides the foundational types for the CTG relay:
//! - Device identities for bedside sensors
//! - Readings and the JSON wire format sensors push
//! - Examinations and the repository contract the relay persists through
//! - An in-memory repository used by the daemon and in tests

pub mod device;
pub mod examination;
pub mod reading;

pub use device::DeviceId;
pub use examination::{
    CtgRow, ExamRepository, Examination, ExaminationId, MemoryExamRepository, RepositoryError,
    DEFAULT_RETAINED_ROWS,
};
pub use reading::{Reading, SensorData, SensorMessage};
