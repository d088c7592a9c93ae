//! SQLite attendance backend.
//!
//! `UNIQUE(name, date)` makes the once-per-day rule hold across processes.

use crate::error::StoreError;
use chrono::{DateTime, NaiveDate, NaiveTime};
use rusqlite::{params, Connection};
use std::path::Path;
use tally_core::ledger::{format_date, format_time, parse_date, TIME_FORMAT};
use tally_core::{AttendanceBackend, AttendanceRecord, InsertOutcome, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    name      TEXT NOT NULL,
    date      TEXT NOT NULL,
    time      TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    source    TEXT NOT NULL,
    UNIQUE (name, date)
);
";

pub struct SqliteAttendance {
    conn: Connection,
}

impl SqliteAttendance {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = crate::open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "attendance database opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn exists(&self, name: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let found: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM attendance WHERE name = ?1 AND date = ?2)",
            params![name, format_date(date)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn insert_record(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO attendance (name, date, time, timestamp, source)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.name,
                record.date_string(),
                record.time_string(),
                record.timestamp.to_rfc3339(),
                record.source,
            ],
        )?;
        Ok(if changed == 0 { InsertOutcome::Duplicate } else { InsertOutcome::Inserted })
    }

    fn load_day(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, date, time, timestamp, source FROM attendance WHERE date = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query([format_date(date)])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let date: String = row.get(1)?;
            let time: String = row.get(2)?;
            let timestamp: String = row.get(3)?;
            records.push(AttendanceRecord {
                date: parse_date(&date)
                    .map_err(|e| StoreError::Corrupt(format!("date {date:?} for {name}: {e}")))?,
                time: NaiveTime::parse_from_str(&time, TIME_FORMAT)
                    .map_err(|e| StoreError::Corrupt(format!("time {time:?} for {name}: {e}")))?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| StoreError::Corrupt(format!("timestamp {timestamp:?}: {e}")))?,
                source: row.get(4)?,
                name,
            });
        }
        Ok(records)
    }
}

impl AttendanceBackend for SqliteAttendance {
    fn is_marked(&mut self, name: &str, date: NaiveDate) -> Result<bool, StorageError> {
        Ok(self.exists(name, date)?)
    }

    fn insert(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StorageError> {
        tracing::trace!(name = %record.name, time = %format_time(record.time), "insert attendance row");
        Ok(self.insert_record(record)?)
    }

    fn records_on(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError> {
        Ok(self.load_day(date)?)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use tally_core::ledger::SOURCE_RECOGNITION;
    use tally_core::{AttendanceLedger, MarkOutcome};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, d, h, m, 0).single().unwrap()
    }

    #[test]
    fn test_insert_then_duplicate() {
        let mut backend = SqliteAttendance::open_in_memory().unwrap();
        let record = AttendanceRecord::new("Alice", at(1, 9, 0), SOURCE_RECOGNITION);
        assert_eq!(backend.insert(&record).unwrap(), InsertOutcome::Inserted);

        let later = AttendanceRecord::new("Alice", at(1, 9, 5), SOURCE_RECOGNITION);
        assert_eq!(backend.insert(&later).unwrap(), InsertOutcome::Duplicate);

        let rows = backend.records_on(record.date).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_string(), "09:00:00");
    }

    #[test]
    fn test_is_marked_per_day() {
        let mut backend = SqliteAttendance::open_in_memory().unwrap();
        let record = AttendanceRecord::new("Alice", at(1, 9, 0), SOURCE_RECOGNITION);
        backend.insert(&record).unwrap();
        assert!(backend.is_marked("Alice", at(1, 0, 0).date_naive()).unwrap());
        assert!(!backend.is_marked("Alice", at(2, 0, 0).date_naive()).unwrap());
        assert!(!backend.is_marked("Bob", at(1, 0, 0).date_naive()).unwrap());
    }

    #[test]
    fn test_records_roundtrip_fields() {
        let mut backend = SqliteAttendance::open_in_memory().unwrap();
        let record = AttendanceRecord::new("Alice", at(3, 14, 30), "manual");
        backend.insert(&record).unwrap();
        let rows = backend.records_on(record.date).unwrap();
        assert_eq!(rows, vec![record]);
    }

    #[test]
    fn test_two_processes_share_unique_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let first = AttendanceLedger::new(Box::new(SqliteAttendance::open(&path).unwrap()));
        let second = AttendanceLedger::new(Box::new(SqliteAttendance::open(&path).unwrap()));

        assert!(matches!(first.mark("Alice", at(5, 8, 0)), MarkOutcome::Marked { .. }));
        assert_eq!(second.mark("Alice", at(5, 8, 1)), MarkOutcome::AlreadyMarked);
        assert_eq!(second.records_on(at(5, 0, 0).date_naive()).unwrap().len(), 1);
    }
}
