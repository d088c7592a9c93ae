//! Persistence seams between the pipeline and its storage backends.

use crate::classifier::TrainingSet;
use crate::ledger::AttendanceRecord;
use crate::types::FaceSample;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no enrollment data yet — register a face first")]
    NoEnrollmentData,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Append-only store of (identity, face sample) pairs.
pub trait EnrollmentSink: Send + Sync {
    /// Persist `samples` under `identity`. Either every sample is written or none is.
    ///
    /// Returns the number of samples now stored for `identity`.
    fn append(&self, identity: &str, samples: &[FaceSample]) -> Result<usize, StorageError>;
}

/// Read side of the enrollment store, used to (re)train the classifier.
pub trait EnrollmentSource {
    /// All enrolled pairs in insertion order.
    ///
    /// Returns [`StorageError::NoEnrollmentData`] when nothing is enrolled yet.
    fn load_for_training(&self) -> Result<TrainingSet, StorageError>;
}

/// Result of a conditional attendance insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same (name, date) already exists; nothing was written.
    Duplicate,
}

/// Persisted attendance records, at most one per (name, date).
pub trait AttendanceBackend: Send {
    /// Whether a record exists for `name` on `date`.
    fn is_marked(&mut self, name: &str, date: NaiveDate) -> Result<bool, StorageError>;

    /// Insert `record` unless one already exists for its (name, date).
    fn insert(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StorageError>;

    /// Records for `date` in insertion order.
    fn records_on(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError>;

    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;
}
