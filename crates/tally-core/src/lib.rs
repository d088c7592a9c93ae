//! tally-core — Face enrollment and attendance pipeline.
//!
//! Haar cascade face location, enrollment sample collection, a k-nearest
//! neighbor classifier over raw face crops, and a per-day deduplicating
//! attendance ledger.

pub mod classifier;
pub mod collector;
pub mod detector;
pub mod ledger;
pub mod recognition;
pub mod storage;
pub mod types;

pub use classifier::{ClassifierError, KnnClassifier, TrainingSet};
pub use collector::{FrameFeedback, Phase, Progress, SampleCollector};
pub use detector::{CascadeDetector, DetectorError, FaceLocator};
pub use ledger::{AttendanceLedger, AttendanceRecord, MarkOutcome};
pub use recognition::{FrameReport, RecognitionLoop};
pub use storage::{AttendanceBackend, EnrollmentSink, EnrollmentSource, InsertOutcome, StorageError};
pub use types::{BoundingBox, FaceSample, Identity};
