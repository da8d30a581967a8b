use serde::{Deserialize, Serialize};

/// Bounding box for a detected reference object, in original image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self { x1, y1, x2, y2, confidence }
    }

    /// Box height in pixels (`y2 - y1`), the quantity the scale is derived from.
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Box area with inclusive pixel bounds: `(x2 - x1 + 1) * (y2 - y1 + 1)`.
    pub fn inclusive_area(&self) -> f32 {
        (self.x2 - self.x1 + 1.0) * (self.y2 - self.y1 + 1.0)
    }

    pub fn as_xyxy(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Output of the reference-scale stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleReading {
    /// Surviving detections, highest confidence first.
    pub detections: Vec<Detection>,
    /// Pixels per centimetre. `0.0` when nothing was detected.
    pub pixel_per_cm: f64,
}

impl ScaleReading {
    pub fn bboxes(&self) -> Vec<[f32; 4]> {
        self.detections.iter().map(Detection::as_xyxy).collect()
    }

    pub fn scores(&self) -> Vec<f32> {
        self.detections.iter().map(|d| d.confidence).collect()
    }

    pub fn best(&self) -> Option<&Detection> {
        self.detections.first()
    }

    /// A scale is only usable when strictly positive and finite.
    pub fn is_valid(&self) -> bool {
        self.pixel_per_cm.is_finite() && self.pixel_per_cm > 0.0
    }
}

/// Per-person measurement produced by the geometry engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightEstimate {
    /// Seven segment lengths in [`BodySegment`](crate::landmarks::BodySegment) order.
    /// Pixels in 2D mode, perspective-corrected centimetres in 3D mode.
    pub distances: [f64; 7],
    /// Height from the summed segments, calibrated once.
    pub cm_direct: f64,
    /// Height from the individually calibrated segments.
    pub cm_sum: f64,
    pub diff: f64,
}

impl HeightEstimate {
    pub fn from_parts(distances: [f64; 7], cm_direct: f64, cm_sum: f64) -> Self {
        Self {
            distances,
            cm_direct,
            cm_sum,
            diff: (cm_direct - cm_sum).abs(),
        }
    }
}

/// Column-oriented estimates for every measured person in a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeightReport {
    /// Index of each row's pose in the input. Skipped poses leave gaps.
    pub persons: Vec<usize>,
    pub heights: Vec<f64>,
    pub distances: Vec<[f64; 7]>,
    pub cm_direct: Vec<f64>,
    pub cm_sum: Vec<f64>,
    pub diffs: Vec<f64>,
}

impl HeightReport {
    /// Append the next row, numbered after the rows already present.
    pub fn push(&mut self, estimate: HeightEstimate) {
        self.push_person(self.len(), estimate);
    }

    /// Append a row for the pose at `person` in the input.
    pub fn push_person(&mut self, person: usize, estimate: HeightEstimate) {
        self.persons.push(person);
        self.heights.push(estimate.cm_direct);
        self.distances.push(estimate.distances);
        self.cm_direct.push(estimate.cm_direct);
        self.cm_sum.push(estimate.cm_sum);
        self.diffs.push(estimate.diff);
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }
}

impl FromIterator<HeightEstimate> for HeightReport {
    fn from_iter<I: IntoIterator<Item = HeightEstimate>>(iter: I) -> Self {
        let mut report = Self::default();
        for estimate in iter {
            report.push(estimate);
        }
        report
    }
}
