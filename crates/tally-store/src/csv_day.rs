//! Per-day CSV attendance files.
//!
//! One file per calendar day, `Attendance_DD-MM-YYYY.csv`, with a `NAME,TIME`
//! header written once when the file is created.

use crate::error::StoreError;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tally_core::ledger::{format_date, TIME_FORMAT};
use tally_core::{AttendanceBackend, AttendanceRecord, InsertOutcome, StorageError};

const HEADER: [&str; 2] = ["NAME", "TIME"];
const SOURCE_CSV: &str = "csv";

pub struct CsvDayFiles {
    dir: PathBuf,
}

impl CsvDayFiles {
    /// Use `dir` for day files, creating it if missing.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        tracing::debug!(dir = %dir.display(), "csv attendance directory ready");
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("Attendance_{}.csv", format_date(date)))
    }

    /// `(name, time)` rows of the day file; empty when it does not exist.
    fn read_rows(&self, date: NaiveDate) -> Result<Vec<(String, String)>, StoreError> {
        let path = self.path_for(date);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let mut rows = Vec::new();
        for result in reader.records() {
            let row = result?;
            let name = row.get(0).unwrap_or_default().to_string();
            let time = row.get(1).unwrap_or_default().to_string();
            rows.push((name, time));
        }
        Ok(rows)
    }

    fn append_row(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.date);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let fresh = file.metadata()?.len() == 0;

        let mut writer = csv::Writer::from_writer(file);
        if fresh {
            writer.write_record(HEADER)?;
        }
        writer.write_record([record.name.as_str(), record.time_string().as_str()])?;
        writer.flush()?;

        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        file.sync_data()?;
        Ok(())
    }

    fn to_record(date: NaiveDate, name: String, time: &str) -> Result<AttendanceRecord, StoreError> {
        let time = NaiveTime::parse_from_str(time, TIME_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("time {time:?} for {name}: {e}")))?;
        let timestamp = Local
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|t: DateTime<Local>| t.fixed_offset())
            .unwrap_or_else(|| date.and_time(time).and_utc().fixed_offset());
        Ok(AttendanceRecord {
            name,
            date,
            time,
            timestamp,
            source: SOURCE_CSV.to_string(),
        })
    }
}

impl AttendanceBackend for CsvDayFiles {
    fn is_marked(&mut self, name: &str, date: NaiveDate) -> Result<bool, StorageError> {
        Ok(self.read_rows(date)?.iter().any(|(n, _)| n == name))
    }

    /// The file cannot enforce uniqueness, so the check runs again here.
    fn insert(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StorageError> {
        if self.is_marked(&record.name, record.date)? {
            return Ok(InsertOutcome::Duplicate);
        }
        self.append_row(record)?;
        Ok(InsertOutcome::Inserted)
    }

    fn records_on(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError> {
        self.read_rows(date)?
            .into_iter()
            .map(|(name, time)| Self::to_record(date, name, &time).map_err(StorageError::from))
            .collect()
    }

    fn name(&self) -> &'static str {
        "csv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ledger::SOURCE_RECOGNITION;
    use tally_core::{AttendanceLedger, MarkOutcome};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, d, h, m, 0).single().unwrap()
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = CsvDayFiles::open(dir.path()).unwrap();
        files
            .insert(&AttendanceRecord::new("Alice", at(1, 9, 0), SOURCE_RECOGNITION))
            .unwrap();
        files
            .insert(&AttendanceRecord::new("Bob", at(1, 9, 2), SOURCE_RECOGNITION))
            .unwrap();

        let path = dir.path().join("Attendance_01-01-2024.csv");
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "NAME,TIME\nAlice,09:00:00\nBob,09:02:00\n");
    }

    #[test]
    fn test_duplicate_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = CsvDayFiles::open(dir.path()).unwrap();
        let first = AttendanceRecord::new("Alice", at(1, 9, 0), SOURCE_RECOGNITION);
        let again = AttendanceRecord::new("Alice", at(1, 9, 5), SOURCE_RECOGNITION);
        assert_eq!(files.insert(&first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(files.insert(&again).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(files.records_on(first.date).unwrap().len(), 1);
    }

    #[test]
    fn test_separate_file_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AttendanceLedger::new(Box::new(CsvDayFiles::open(dir.path()).unwrap()));
        assert!(matches!(ledger.mark("Alice", at(1, 9, 0)), MarkOutcome::Marked { .. }));
        assert!(matches!(ledger.mark("Alice", at(2, 9, 0)), MarkOutcome::Marked { .. }));
        assert!(dir.path().join("Attendance_01-01-2024.csv").exists());
        assert!(dir.path().join("Attendance_02-01-2024.csv").exists());
    }

    #[test]
    fn test_records_on_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = CsvDayFiles::open(dir.path()).unwrap();
        assert!(files.records_on(at(9, 0, 0).date_naive()).unwrap().is_empty());
        assert!(!files.is_marked("Alice", at(9, 0, 0).date_naive()).unwrap());
    }

    #[test]
    fn test_records_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = CsvDayFiles::open(dir.path()).unwrap();
        let record = AttendanceRecord::new("Alice", at(4, 17, 45), SOURCE_RECOGNITION);
        files.insert(&record).unwrap();

        let rows = files.records_on(record.date).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Alice");
        assert_eq!(rows[0].time_string(), "17:45:00");
        assert_eq!(rows[0].source, "csv");
    }

    #[test]
    fn test_name_with_comma_is_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = CsvDayFiles::open(dir.path()).unwrap();
        let record = AttendanceRecord::new("Doe, Jane", at(1, 9, 0), SOURCE_RECOGNITION);
        files.insert(&record).unwrap();
        assert!(files.is_marked("Doe, Jane", record.date).unwrap());
    }
}
