use tally_core::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("no enrollment data yet — register a face first")]
    NoEnrollmentData,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("unknown attendance backend: {0} (expected sqlite or csv)")]
    UnknownBackend(String),
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoEnrollmentData => StorageError::NoEnrollmentData,
            StoreError::InvalidInput(msg) => StorageError::InvalidInput(msg),
            StoreError::Corrupt(msg) => StorageError::Corrupt(msg),
            StoreError::Io(e) => StorageError::Io(e),
            other => StorageError::Backend(other.to_string()),
        }
    }
}
