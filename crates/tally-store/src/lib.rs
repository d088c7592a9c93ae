//! tally-store — Persistence for enrollment samples and attendance records.
//!
//! Enrollment always lives in SQLite. Attendance can go to the same kind of
//! database or to one `Attendance_DD-MM-YYYY.csv` file per day.

pub mod csv_day;
pub mod enrollment;
pub mod error;
pub mod sqlite;

pub use csv_day::CsvDayFiles;
pub use enrollment::EnrollmentStore;
pub use error::StoreError;
pub use sqlite::SqliteAttendance;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tally_core::AttendanceBackend;

/// Which attendance backend to write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Csv,
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "csv" => Ok(BackendKind::Csv),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Csv => write!(f, "csv"),
        }
    }
}

/// Open the attendance backend selected by `kind`.
pub fn open_attendance(
    kind: BackendKind,
    db_path: &Path,
    csv_dir: &Path,
) -> Result<Box<dyn AttendanceBackend>, StoreError> {
    Ok(match kind {
        BackendKind::Sqlite => Box::new(SqliteAttendance::open(db_path)?),
        BackendKind::Csv => Box::new(CsvDayFiles::open(csv_dir)?),
    })
}

/// Open a file-backed connection, creating the parent directory if needed.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!(" CSV ".parse::<BackendKind>().unwrap(), BackendKind::Csv);
        assert!(matches!("xml".parse::<BackendKind>(), Err(StoreError::UnknownBackend(_))));
        assert_eq!(BackendKind::Csv.to_string(), "csv");
    }

    #[test]
    fn test_open_attendance_names() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tally.db");
        let csv = dir.path().join("attendance");
        assert_eq!(open_attendance(BackendKind::Sqlite, &db, &csv).unwrap().name(), "sqlite");
        assert_eq!(open_attendance(BackendKind::Csv, &db, &csv).unwrap().name(), "csv");
        assert!(csv.is_dir());
    }
}
