//! Pixel-per-centimetre calibration from a reference object of known height.

use crate::detector::{BoxDetector, DetectorError};
use crate::types::{Detection, ScaleReading};
use image::RgbImage;
use thiserror::Error;

/// Physical height of the default reference object.
pub const DEFAULT_REFERENCE_HEIGHT_CM: f64 = 30.5;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("reference detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("reference object height must be positive, got {0} cm")]
    InvalidReferenceHeight(f64),
}

/// Detects the reference object and derives the frame's scale.
pub struct ReferenceScaleDetector<D> {
    detector: D,
    reference_height_cm: f64,
    /// Minimum detection confidence. Also used as the suppression IoU threshold.
    threshold: f32,
}

impl<D: BoxDetector> ReferenceScaleDetector<D> {
    pub fn new(detector: D, reference_height_cm: f64, threshold: f32) -> Result<Self, ScaleError> {
        if !(reference_height_cm.is_finite() && reference_height_cm > 0.0) {
            return Err(ScaleError::InvalidReferenceHeight(reference_height_cm));
        }
        Ok(Self {
            detector,
            reference_height_cm,
            threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Detect, suppress duplicates and derive `pixel_per_cm` from the best box.
    ///
    /// Returns an empty reading with `pixel_per_cm == 0.0` when nothing is
    /// detected; callers must check [`ScaleReading::is_valid`] before dividing.
    pub fn process(&self, image: &RgbImage) -> Result<ScaleReading, ScaleError> {
        let candidates: Vec<Detection> = self
            .detector
            .detect(image, self.threshold)?
            .into_iter()
            .filter(|d| d.confidence >= self.threshold)
            .collect();

        if candidates.is_empty() {
            tracing::warn!(threshold = self.threshold, "no reference object detected");
            return Ok(ScaleReading::default());
        }

        let total = candidates.len();
        // Suppression reuses the confidence threshold as its IoU threshold.
        let mut detections = nms(candidates, self.threshold);
        sort_by_confidence(&mut detections);

        let pixel_per_cm = detections
            .first()
            .map(|best| pixel_per_cm(best, self.reference_height_cm))
            .unwrap_or(0.0);

        tracing::info!(
            candidates = total,
            kept = detections.len(),
            pixel_per_cm,
            "reference scale derived"
        );

        Ok(ScaleReading {
            detections,
            pixel_per_cm,
        })
    }
}

/// Scale implied by `best` if it is `reference_height_cm` tall.
pub fn pixel_per_cm(best: &Detection, reference_height_cm: f64) -> f64 {
    best.height() as f64 / reference_height_cm
}

fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Greedy Non-Maximum Suppression.
///
/// Keeps the highest-scoring box, drops every remaining box whose IoU with it
/// exceeds `iou_threshold`, and repeats on what is left.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union with inclusive pixel bounds.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_w = (x2 - x1 + 1.0).max(0.0);
    let inter_h = (y2 - y1 + 1.0).max(0.0);
    let inter_area = inter_w * inter_h;

    let union_area = a.inclusive_area() + b.inclusive_area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
