//! Per-frame recognition: locate → classify → mark attendance → annotate.

use crate::classifier::KnnClassifier;
use crate::detector::FaceLocator;
use crate::ledger::{AttendanceLedger, MarkOutcome};
use crate::types::{BoundingBox, FaceSample, Identity};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// A detected face and the identity it was classified as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub identity: Identity,
}

/// Ledger call made while processing a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    pub identity: Identity,
    pub outcome: MarkOutcome,
}

/// Output of one frame: the annotated image plus what happened.
pub struct FrameReport {
    pub frame: RgbImage,
    pub faces: Vec<FaceAnnotation>,
    pub events: Vec<AttendanceEvent>,
}

/// One recognition run.
///
/// The in-session register only saves ledger round trips for identities
/// already handled in this run; the ledger's persisted check decides. The
/// register is dropped with the run. `process_frame` takes `&mut self`, so
/// frames of one run are processed one at a time.
pub struct RecognitionLoop {
    locator: Arc<dyn FaceLocator>,
    classifier: Arc<KnnClassifier>,
    ledger: Arc<AttendanceLedger>,
    register: HashSet<Identity>,
    run_id: Uuid,
}

impl RecognitionLoop {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        classifier: Arc<KnnClassifier>,
        ledger: Arc<AttendanceLedger>,
    ) -> Self {
        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, identities = classifier.identities().len(), "recognition run started");
        Self {
            locator,
            classifier,
            ledger,
            register: HashSet::new(),
            run_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Whether `identity` was already handled during this run.
    pub fn seen(&self, identity: &str) -> bool {
        self.register.contains(identity)
    }

    pub fn process_frame(&mut self, mut frame: RgbImage, now: DateTime<Local>) -> FrameReport {
        let boxes = self.locator.locate(&frame);
        let mut faces = Vec::with_capacity(boxes.len());
        let mut events = Vec::new();

        for bbox in boxes {
            let Some(sample) = FaceSample::from_crop(&frame, &bbox) else {
                continue;
            };
            let identity = self.classifier.predict(&sample);

            if !identity.is_empty() && self.register.insert(identity.clone()) {
                let outcome = self.ledger.mark(&identity, now);
                tracing::debug!(run_id = %self.run_id, identity = %identity, ?outcome, "first sighting this run");
                events.push(AttendanceEvent {
                    identity: identity.clone(),
                    outcome,
                });
            }

            faces.push(FaceAnnotation { bbox, identity });
        }

        for face in &faces {
            draw_box(&mut frame, &face.bbox, BOX_COLOR, BOX_THICKNESS);
        }

        FrameReport { frame, faces, events }
    }

    /// End the run, returning the identities it handled.
    pub fn finish(self) -> Vec<Identity> {
        let mut seen: Vec<Identity> = self.register.into_iter().collect();
        seen.sort();
        tracing::info!(run_id = %self.run_id, identities = seen.len(), "recognition run finished");
        seen
    }
}

/// Draw a hollow rectangle, clipped to the image.
pub fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let Some(b) = bbox.clamp_to(img.width(), img.height()) else {
        return;
    };
    let (x0, y0) = (b.x, b.y);
    let (x1, y1) = (b.x + b.width - 1, b.y + b.height - 1);

    for t in 0..thickness {
        for x in x0..=x1 {
            if y0 + t <= y1 {
                img.put_pixel(x, y0 + t, color);
            }
            if y1 >= y0 + t {
                img.put_pixel(x, y1 - t, color);
            }
        }
        for y in y0..=y1 {
            if x0 + t <= x1 {
                img.put_pixel(x0 + t, y, color);
            }
            if x1 >= x0 + t {
                img.put_pixel(x1 - t, y, color);
            }
        }
    }
}
