//! SQLite enrollment store.
//!
//! One row per face sample: the identity label and the raw 50×50 RGB pixels.
//! Ordered by row id, the two columns form the co-indexed label and feature
//! sequences used for training. Each `append` is a single transaction.

use crate::error::StoreError;
use ndarray::Array2;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_core::types::FEATURE_LEN;
use tally_core::{EnrollmentSink, EnrollmentSource, FaceSample, StorageError, TrainingSet};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity    TEXT NOT NULL,
    pixels      BLOB NOT NULL,
    enrolled_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS samples_identity ON samples (identity);
";

pub struct EnrollmentStore {
    conn: Mutex<Connection>,
}

impl EnrollmentStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = crate::open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "enrollment store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `samples` for `identity`; all rows commit together or not at all.
    ///
    /// Returns the total number of samples stored for `identity`.
    pub fn append(&self, identity: &str, samples: &[FaceSample]) -> Result<usize, StoreError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(StoreError::InvalidInput("identity is empty".into()));
        }
        if samples.is_empty() {
            return Err(StoreError::InvalidInput("no face samples to save".into()));
        }
        if let Some(bad) = samples.iter().find(|s| s.as_bytes().len() != FEATURE_LEN) {
            return Err(StoreError::InvalidInput(format!(
                "sample has {} bytes, expected {FEATURE_LEN}",
                bad.as_bytes().len()
            )));
        }

        let enrolled_at = chrono::Local::now().to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO samples (identity, pixels, enrolled_at) VALUES (?1, ?2, ?3)")?;
            for sample in samples {
                stmt.execute(params![identity, sample.as_bytes(), enrolled_at])?;
            }
        }
        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM samples WHERE identity = ?1",
            [identity],
            |row| row.get(0),
        )?;
        tx.commit()?;

        tracing::info!(identity, added = samples.len(), total, "face samples saved");
        Ok(total as usize)
    }

    /// Every stored pair in insertion order.
    pub fn load_for_training(&self) -> Result<TrainingSet, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT identity, pixels FROM samples ORDER BY id")?;
        let mut rows = stmt.query([])?;

        let mut labels = Vec::new();
        let mut flat: Vec<f32> = Vec::new();
        while let Some(row) = rows.next()? {
            let identity: String = row.get(0)?;
            let pixels: Vec<u8> = row.get(1)?;
            if pixels.len() != FEATURE_LEN {
                return Err(StoreError::Corrupt(format!(
                    "sample {} for {identity} has {} bytes, expected {FEATURE_LEN}",
                    labels.len(),
                    pixels.len()
                )));
            }
            flat.extend(pixels.iter().map(|&p| p as f32));
            labels.push(identity);
        }

        if labels.is_empty() {
            return Err(StoreError::NoEnrollmentData);
        }

        let features = Array2::from_shape_vec((labels.len(), FEATURE_LEN), flat)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        TrainingSet::new(labels, features).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Enrolled identities with their sample counts, sorted by name.
    pub fn identities(&self) -> Result<Vec<(String, usize)>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT identity, COUNT(*) FROM samples GROUP BY identity ORDER BY identity")?;
        let rows = stmt.query_map([], |row| {
            let count: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, count as usize))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn sample_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl EnrollmentSink for EnrollmentStore {
    fn append(&self, identity: &str, samples: &[FaceSample]) -> Result<usize, StorageError> {
        EnrollmentStore::append(self, identity, samples).map_err(StorageError::from)
    }
}

impl EnrollmentSource for EnrollmentStore {
    fn load_for_training(&self) -> Result<TrainingSet, StorageError> {
        EnrollmentStore::load_for_training(self).map_err(StorageError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::KnnClassifier;

    fn sample(value: u8) -> FaceSample {
        FaceSample::from_raw(vec![value; FEATURE_LEN]).unwrap()
    }

    fn five(value: u8) -> Vec<FaceSample> {
        (0..5).map(|i| sample(value + i)).collect()
    }

    #[test]
    fn test_append_and_load_roundtrip() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        assert_eq!(store.append("Alice", &five(10)).unwrap(), 5);
        assert_eq!(store.append("Bob", &five(200)).unwrap(), 5);

        let set = store.load_for_training().unwrap();
        assert_eq!(set.len(), 10);
        assert_eq!(set.labels()[0], "Alice");
        assert_eq!(set.labels()[9], "Bob");

        let model = KnnClassifier::fit(set).unwrap();
        assert_eq!(model.predict(&sample(12)), "Alice");
        assert_eq!(model.predict(&sample(201)), "Bob");
    }

    #[test]
    fn test_reenrolling_appends() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        store.append("Alice", &five(10)).unwrap();
        assert_eq!(store.append("Alice", &five(30)).unwrap(), 10);
        assert_eq!(store.identities().unwrap(), vec![("Alice".to_string(), 10)]);
    }

    #[test]
    fn test_invalid_input_leaves_store_untouched() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        store.append("Alice", &five(10)).unwrap();

        assert!(matches!(store.append("", &five(10)), Err(StoreError::InvalidInput(_))));
        assert!(matches!(store.append("Bob", &[]), Err(StoreError::InvalidInput(_))));
        assert_eq!(store.sample_count().unwrap(), 5);
    }

    #[test]
    fn test_empty_store_reports_no_enrollment() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        assert!(matches!(store.load_for_training(), Err(StoreError::NoEnrollmentData)));

        let err = KnnClassifier::load(&store).unwrap_err();
        assert!(matches!(err, tally_core::ClassifierError::NoEnrollmentData));
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        store
            .lock()
            .execute(
                "INSERT INTO samples (identity, pixels, enrolled_at) VALUES ('Eve', x'0102', 'now')",
                [],
            )
            .unwrap();
        assert!(matches!(store.load_for_training(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tally.db");
        {
            let store = EnrollmentStore::open(&path).unwrap();
            store.append("Alice", &five(10)).unwrap();
        }
        let store = EnrollmentStore::open(&path).unwrap();
        assert_eq!(store.sample_count().unwrap(), 5);
        assert_eq!(store.load_for_training().unwrap().labels()[0], "Alice");
    }

    #[test]
    fn test_sink_trait_maps_errors() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        let sink: &dyn EnrollmentSink = &store;
        assert!(matches!(sink.append(" ", &five(1)), Err(StorageError::InvalidInput(_))));
    }
}
