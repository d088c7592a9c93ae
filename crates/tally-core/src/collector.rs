//! Enrollment sample collector.
//!
//! `Idle → Capturing → Complete → (commit) → Idle`. Frames arrive on the
//! capture thread through [`SampleCollector::on_frame`] while another thread
//! polls [`SampleCollector::progress`]; the sample list and last-capture time
//! live behind one mutex.

use crate::detector::FaceLocator;
use crate::storage::{EnrollmentSink, StorageError};
use crate::types::{FaceSample, Identity};
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Samples captured per enrollment session.
pub const SAMPLES_PER_SESSION: usize = 5;
/// Minimum spacing between two captures of one session.
pub const MIN_CAPTURE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("saving samples failed: {0}")]
    Storage(#[from] StorageError),
}

/// Monotonic time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    Complete,
}

/// What one frame did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFeedback {
    /// No session is capturing; the frame was ignored.
    Inactive,
    NoFace,
    /// A face was seen but the capture interval has not elapsed yet.
    Waiting { captured: usize },
    /// A new sample was stored.
    Captured { captured: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub identity: Option<Identity>,
    pub captured: usize,
    pub target: usize,
}

/// A finished session, detached from the collector.
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub identity: Identity,
    pub samples: Vec<FaceSample>,
}

/// Outcome of persisting a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentReceipt {
    pub identity: Identity,
    pub captured: usize,
    /// Samples stored for this identity across all sessions.
    pub total_samples: usize,
}

struct Session {
    phase: Phase,
    identity: Identity,
    samples: Vec<FaceSample>,
    last_capture: Option<Duration>,
    /// Bumped whenever a session starts or ends, so a frame located under
    /// one session is never stored into the next.
    generation: u64,
}

impl Session {
    fn idle(generation: u64) -> Self {
        Self {
            phase: Phase::Idle,
            identity: String::new(),
            samples: Vec::new(),
            last_capture: None,
            generation,
        }
    }
}

pub struct SampleCollector {
    locator: Arc<dyn FaceLocator>,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
}

impl SampleCollector {
    pub fn new(locator: Arc<dyn FaceLocator>) -> Self {
        Self::with_clock(locator, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(locator: Arc<dyn FaceLocator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            locator,
            clock,
            session: Mutex::new(Session::idle(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start capturing for `identity`, discarding any unfinished session.
    pub fn begin(&self, identity: &str) -> Result<(), CollectorError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(CollectorError::EmptyIdentity);
        }
        let mut session = self.lock();
        let generation = session.generation + 1;
        *session = Session {
            phase: Phase::Capturing,
            identity: identity.to_string(),
            samples: Vec::with_capacity(SAMPLES_PER_SESSION),
            last_capture: None,
            generation,
        };
        tracing::info!(identity, target = SAMPLES_PER_SESSION, "enrollment capture started");
        Ok(())
    }

    /// Drop the current session and return to idle.
    pub fn abandon(&self) {
        let mut session = self.lock();
        if session.phase != Phase::Idle {
            tracing::info!(
                identity = %session.identity,
                captured = session.samples.len(),
                "enrollment session abandoned"
            );
        }
        let generation = session.generation + 1;
        *session = Session::idle(generation);
    }

    /// Feed one frame. Detection runs outside the session lock.
    pub fn on_frame(&self, frame: &RgbImage) -> FrameFeedback {
        let generation = {
            let session = self.lock();
            if session.phase != Phase::Capturing {
                return FrameFeedback::Inactive;
            }
            session.generation
        };

        // First box in detector output order.
        let sample = self
            .locator
            .locate(frame)
            .first()
            .and_then(|face| FaceSample::from_crop(frame, face));

        let mut session = self.lock();
        if session.phase != Phase::Capturing || session.generation != generation {
            return FrameFeedback::Inactive;
        }
        let Some(sample) = sample else {
            return FrameFeedback::NoFace;
        };

        let now = self.clock.now();
        let due = session
            .last_capture
            .map_or(true, |last| now.saturating_sub(last) >= MIN_CAPTURE_INTERVAL);
        if !due || session.samples.len() >= SAMPLES_PER_SESSION {
            return FrameFeedback::Waiting {
                captured: session.samples.len(),
            };
        }

        session.samples.push(sample);
        session.last_capture = Some(now);
        let captured = session.samples.len();
        tracing::debug!(identity = %session.identity, captured, "captured face sample");

        if captured >= SAMPLES_PER_SESSION {
            session.phase = Phase::Complete;
            tracing::info!(identity = %session.identity, captured, "enrollment capture complete");
        }

        FrameFeedback::Captured { captured }
    }

    pub fn progress(&self) -> Progress {
        let session = self.lock();
        Progress {
            phase: session.phase,
            identity: (session.phase != Phase::Idle).then(|| session.identity.clone()),
            captured: session.samples.len(),
            target: SAMPLES_PER_SESSION,
        }
    }

    /// Copy of the samples captured so far.
    pub fn samples(&self) -> Vec<FaceSample> {
        self.lock().samples.clone()
    }

    /// Detach a completed session, resetting to idle. `None` unless complete.
    pub fn take_completed(&self) -> Option<CompletedSession> {
        let mut session = self.lock();
        if session.phase != Phase::Complete {
            return None;
        }
        let generation = session.generation + 1;
        let done = std::mem::replace(&mut *session, Session::idle(generation));
        Some(CompletedSession {
            identity: done.identity,
            samples: done.samples,
        })
    }

    /// Hand a completed session to `sink`. The store write happens after the
    /// session lock is released; the session is discarded either way.
    pub fn commit(&self, sink: &dyn EnrollmentSink) -> Result<Option<EnrollmentReceipt>, CollectorError> {
        let Some(done) = self.take_completed() else {
            return Ok(None);
        };
        let total_samples = sink.append(&done.identity, &done.samples)?;
        tracing::info!(identity = %done.identity, total_samples, "enrollment saved");
        Ok(Some(EnrollmentReceipt {
            identity: done.identity,
            captured: done.samples.len(),
            total_samples,
        }))
    }
}
