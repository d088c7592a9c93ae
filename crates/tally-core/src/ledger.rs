//! Attendance ledger — at most one record per identity per calendar day.
//!
//! Dates and times are taken in the operator's local civil time zone for
//! both writes and reads.

use crate::storage::{AttendanceBackend, InsertOutcome, StorageError};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Persisted date format, e.g. `01-01-2024`.
pub const DATE_FORMAT: &str = "%d-%m-%Y";
/// Persisted time-of-day format, e.g. `09:00:00`.
pub const TIME_FORMAT: &str = "%H:%M:%S";
/// Source tag for records written by the recognition pipeline.
pub const SOURCE_RECOGNITION: &str = "recognition";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    /// Time of day, truncated to whole seconds.
    pub time: NaiveTime,
    /// Full instant, kept for audit.
    pub timestamp: DateTime<FixedOffset>,
    pub source: String,
}

impl AttendanceRecord {
    pub fn new(name: &str, now: DateTime<Local>, source: &str) -> Self {
        let time = now.time();
        Self {
            name: name.to_string(),
            date: now.date_naive(),
            time: time.with_nanosecond(0).unwrap_or(time),
            timestamp: now.fixed_offset(),
            source: source.to_string(),
        }
    }

    pub fn date_string(&self) -> String {
        format_date(self.date)
    }

    pub fn time_string(&self) -> String {
        format_time(self.time)
    }
}

/// Result of [`AttendanceLedger::mark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was written at this `HH:MM:SS` time.
    Marked { time: String },
    /// The identity already has a record for the day; nothing was written.
    AlreadyMarked,
    /// The record could not be checked or written. Not retried.
    Failed(String),
}

/// Deduplicating front end over an [`AttendanceBackend`].
///
/// The existence check and the insert run under one lock, so two marks for
/// the same identity from this process can never both write. Backends that
/// enforce a unique (name, date) key also cover writers in other processes;
/// a lost race there surfaces as [`MarkOutcome::AlreadyMarked`].
pub struct AttendanceLedger {
    backend: Mutex<Box<dyn AttendanceBackend>>,
    source: String,
}

impl AttendanceLedger {
    pub fn new(backend: Box<dyn AttendanceBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
            source: SOURCE_RECOGNITION.to_string(),
        }
    }

    /// Tag written records with `source` instead of `recognition`.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Record attendance for `identity` at `now` unless already recorded that day.
    ///
    /// Surrounding whitespace is not part of the identity.
    pub fn mark(&self, identity: &str, now: DateTime<Local>) -> MarkOutcome {
        let identity = identity.trim();
        if identity.is_empty() {
            return MarkOutcome::Failed("identity is empty".into());
        }

        let record = AttendanceRecord::new(identity, now, &self.source);
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);

        match backend.is_marked(identity, record.date) {
            Ok(true) => {
                tracing::debug!(identity, date = %record.date_string(), "attendance already marked");
                return MarkOutcome::AlreadyMarked;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(identity, error = %e, "attendance lookup failed");
                return MarkOutcome::Failed(e.to_string());
            }
        }

        match backend.insert(&record) {
            Ok(InsertOutcome::Inserted) => {
                let time = record.time_string();
                tracing::info!(
                    identity,
                    date = %record.date_string(),
                    time = %time,
                    backend = backend.name(),
                    "attendance marked"
                );
                MarkOutcome::Marked { time }
            }
            Ok(InsertOutcome::Duplicate) => {
                tracing::debug!(identity, "attendance insert lost a race; already marked");
                MarkOutcome::AlreadyMarked
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "attendance write failed");
                MarkOutcome::Failed(e.to_string())
            }
        }
    }

    /// Records for `date`, in insertion order.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError> {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records_on(date)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    /// In-memory backend; `fail_writes` simulates a broken disk.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub(crate) records: Arc<Mutex<Vec<AttendanceRecord>>>,
        pub(crate) fail_writes: bool,
    }

    impl AttendanceBackend for MemoryBackend {
        fn is_marked(&mut self, name: &str, date: NaiveDate) -> Result<bool, StorageError> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().any(|r| r.name == name && r.date == date))
        }

        fn insert(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StorageError> {
            if self.fail_writes {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(InsertOutcome::Inserted)
        }

        fn records_on(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().filter(|r| r.date == date).cloned().collect())
        }

        fn name(&self) -> &'static str {
            "memory"
        }
    }

    pub(crate) fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn ledger() -> (AttendanceLedger, Arc<Mutex<Vec<AttendanceRecord>>>) {
        let backend = MemoryBackend::default();
        let records = backend.records.clone();
        (AttendanceLedger::new(Box::new(backend)), records)
    }

    #[test]
    fn test_mark_twice_same_day() {
        let (ledger, records) = ledger();
        assert_eq!(
            ledger.mark("Alice", local(2024, 1, 1, 9, 0)),
            MarkOutcome::Marked { time: "09:00:00".into() }
        );
        assert_eq!(ledger.mark("Alice", local(2024, 1, 1, 9, 5)), MarkOutcome::AlreadyMarked);
        assert_eq!(records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_on_two_days() {
        let (ledger, records) = ledger();
        assert!(matches!(ledger.mark("Alice", local(2024, 1, 1, 9, 0)), MarkOutcome::Marked { .. }));
        assert!(matches!(ledger.mark("Alice", local(2024, 1, 2, 9, 0)), MarkOutcome::Marked { .. }));
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].date, records[1].date);
    }

    #[test]
    fn test_distinct_identities_same_day() {
        let (ledger, _) = ledger();
        assert!(matches!(ledger.mark("Alice", local(2024, 3, 4, 8, 0)), MarkOutcome::Marked { .. }));
        assert!(matches!(ledger.mark("Bob", local(2024, 3, 4, 8, 1)), MarkOutcome::Marked { .. }));
        assert_eq!(ledger.records_on(local(2024, 3, 4, 0, 0).date_naive()).unwrap().len(), 2);
    }

    #[test]
    fn test_mark_empty_identity_fails() {
        let (ledger, records) = ledger();
        assert!(matches!(ledger.mark("  ", local(2024, 1, 1, 9, 0)), MarkOutcome::Failed(_)));
        assert!(records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_padded_identity_is_the_same_person() {
        let (ledger, records) = ledger();
        assert!(matches!(ledger.mark(" Alice ", local(2024, 1, 1, 9, 0)), MarkOutcome::Marked { .. }));
        assert_eq!(ledger.mark("Alice", local(2024, 1, 1, 9, 5)), MarkOutcome::AlreadyMarked);
        assert_eq!(ledger.mark("\tAlice", local(2024, 1, 1, 9, 6)), MarkOutcome::AlreadyMarked);
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Alice");
    }

    #[test]
    fn test_write_failure_reported() {
        let backend = MemoryBackend { fail_writes: true, ..Default::default() };
        let ledger = AttendanceLedger::new(Box::new(backend));
        match ledger.mark("Alice", local(2024, 1, 1, 9, 0)) {
            MarkOutcome::Failed(reason) => assert!(reason.contains("disk full")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_record_fields() {
        let now = Local.with_ymd_and_hms(2024, 1, 1, 9, 0, 7).single().unwrap()
            + chrono::Duration::milliseconds(450);
        let record = AttendanceRecord::new("Alice", now, SOURCE_RECOGNITION);
        assert_eq!(record.date_string(), "01-01-2024");
        assert_eq!(record.time_string(), "09:00:07");
        assert_eq!(record.timestamp, now.fixed_offset());
        assert_eq!(record.source, "recognition");
    }

    #[test]
    fn test_parse_and_format_date() {
        let date = parse_date("15-08-2024").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 8, 15).unwrap());
        assert_eq!(format_date(date), "15-08-2024");
        assert!(parse_date("2024-08-15").is_err());
    }

    #[test]
    fn test_concurrent_marks_write_once() {
        let backend = MemoryBackend::default();
        let records = backend.records.clone();
        let ledger = Arc::new(AttendanceLedger::new(Box::new(backend)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.mark("Alice", local(2024, 5, 6, 10, 0)))
            })
            .collect();
        let marked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, MarkOutcome::Marked { .. }))
            .count();

        assert_eq!(marked, 1);
        assert_eq!(records.lock().unwrap().len(), 1);
    }
}
