//! Reference-object detector via ONNX Runtime.
//!
//! Runs a YOLO-style single-stage detector exported to ONNX. The model takes a
//! letterboxed `[1, 3, S, S]` RGB tensor in `[0, 1]` and emits `[1, 4 + C, N]`
//! predictions: centre/size boxes in input space followed by per-class scores.

use crate::artifact::{load_onnx_session, LazyArtifact, ModelLoadError};
use crate::types::Detection;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const YOLO_INPUT_SIZE: usize = 640;
const YOLO_LETTERBOX_FILL: u8 = 114;
const YOLO_BOX_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model input size must be positive, got {0}")]
    InvalidInputSize(usize),
    #[error("image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Source of candidate reference-object boxes.
///
/// Implementations return every candidate whose confidence is at least
/// `threshold`, in original image pixel coordinates, in any order.
pub trait BoxDetector: Send + Sync {
    fn detect(&self, image: &RgbImage, threshold: f32) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    orig_width: f32,
    orig_height: f32,
}

impl LetterboxInfo {
    fn new(width: u32, height: u32, input_size: usize) -> Self {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let (new_w, new_h) = Self::resized_dims(width, height, scale, input_size);
        Self {
            scale,
            pad_x: ((input_size as u32 - new_w) / 2) as f32,
            pad_y: ((input_size as u32 - new_h) / 2) as f32,
            orig_width: width as f32,
            orig_height: height as f32,
        }
    }

    fn resized_dims(width: u32, height: u32, scale: f32, input_size: usize) -> (u32, u32) {
        let max = input_size as u32;
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, max);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, max);
        (new_w, new_h)
    }

    /// Map an input-space `(x, y)` back to original pixels, clipped to the frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            ((x - self.pad_x) / self.scale).clamp(0.0, self.orig_width),
            ((y - self.pad_y) / self.scale).clamp(0.0, self.orig_height),
        )
    }
}

struct YoloSession {
    session: Session,
}

/// YOLO-based reference-object detector.
///
/// The ONNX session is loaded on first use and shared by all callers; `run`
/// needs exclusive access so inference is serialized behind a mutex.
pub struct YoloBoxDetector {
    model: LazyArtifact<Mutex<YoloSession>>,
    input_size: usize,
    /// Restrict scoring to one class. `None` takes the best class per anchor.
    class_id: Option<usize>,
}

impl YoloBoxDetector {
    pub fn new(model_path: impl Into<PathBuf>, input_size: usize, class_id: Option<usize>) -> Self {
        Self {
            model: LazyArtifact::new(model_path),
            input_size,
            class_id,
        }
    }

    pub fn model_path(&self) -> &Path {
        self.model.path()
    }

    fn session(&self) -> Result<&Mutex<YoloSession>, ModelLoadError> {
        self.model.get_or_load(|path| {
            let session = load_onnx_session(path)?;

            tracing::info!(
                path = %path.display(),
                inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
                outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
                "loaded reference detector model"
            );

            Ok(Mutex::new(YoloSession { session }))
        })
    }

    /// Letterbox an RGB frame into a NCHW float tensor scaled to `[0, 1]`.
    fn preprocess(image: &RgbImage, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = image.dimensions();
        let letterbox = LetterboxInfo::new(width, height, input_size);
        let (new_w, new_h) = LetterboxInfo::resized_dims(width, height, letterbox.scale, input_size);

        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let fill = YOLO_LETTERBOX_FILL as f32 / 255.0;
        let mut tensor = Array4::<f32>::from_elem((1, 3, input_size, input_size), fill);

        let pad_x = letterbox.pad_x as usize;
        let pad_y = letterbox.pad_y as usize;
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel.0[c] as f32 / 255.0;
            }
        }

        (tensor, letterbox)
    }
}

impl BoxDetector for YoloBoxDetector {
    fn detect(&self, image: &RgbImage, threshold: f32) -> Result<Vec<Detection>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyImage { width, height });
        }
        if self.input_size == 0 {
            return Err(DetectorError::InvalidInputSize(self.input_size));
        }

        let session = self.session()?;
        let (input, letterbox) = Self::preprocess(image, self.input_size);

        let mut guard = session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session lock poisoned".into()))?;
        let outputs = guard
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("predictions: {e}")))?;

        if shape.len() != 3 || shape[1] <= YOLO_BOX_CHANNELS as i64 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected [1, 4 + classes, anchors] output, got {:?}",
                &shape[..]
            )));
        }
        let channels = shape[1] as usize;
        let anchors = shape[2] as usize;

        let detections =
            decode_predictions(data, channels, anchors, &letterbox, threshold, self.class_id);
        tracing::debug!(
            candidates = detections.len(),
            threshold,
            "reference detector: decoded candidates"
        );

        Ok(detections)
    }
}

/// Decode a channel-major `[4 + C, N]` prediction block.
fn decode_predictions(
    data: &[f32],
    channels: usize,
    anchors: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
    class_id: Option<usize>,
) -> Vec<Detection> {
    let at = |c: usize, i: usize| data.get(c * anchors + i).copied().unwrap_or(0.0);
    let num_classes = channels - YOLO_BOX_CHANNELS;

    let mut detections = Vec::new();

    for i in 0..anchors {
        let score = match class_id {
            Some(cls) if cls < num_classes => at(YOLO_BOX_CHANNELS + cls, i),
            Some(_) => 0.0,
            None => (0..num_classes)
                .map(|cls| at(YOLO_BOX_CHANNELS + cls, i))
                .fold(0.0f32, f32::max),
        };
        if score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

        detections.push(Detection::new(x1, y1, x2, y2, score));
    }

    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a channel-major prediction block from per-anchor rows.
    fn block(rows: &[[f32; 6]]) -> Vec<f32> {
        let anchors = rows.len();
        let mut data = vec![0.0; 6 * anchors];
        for (i, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                data[c * anchors + i] = *v;
            }
        }
        data
    }

    #[test]
    fn test_letterbox_landscape_pads_vertically() {
        let lb = LetterboxInfo::new(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        // 720 * 0.5 = 360 -> (640 - 360) / 2 = 140
        assert_eq!(lb.pad_y, 140.0);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = LetterboxInfo::new(320, 240, 640);
        let (ox, oy) = (100.0f32, 50.0f32);
        let (lx, ly) = (ox * lb.scale + lb.pad_x, oy * lb.scale + lb.pad_y);
        let (rx, ry) = lb.unmap(lx, ly);
        assert!((rx - ox).abs() < 0.1, "x: {rx} vs {ox}");
        assert!((ry - oy).abs() < 0.1, "y: {ry} vs {oy}");
    }

    #[test]
    fn test_unmap_clips_to_frame() {
        let lb = LetterboxInfo::new(640, 640, 640);
        assert_eq!(lb.unmap(-20.0, 700.0), (0.0, 640.0));
    }

    #[test]
    fn test_decode_filters_by_threshold() {
        let lb = LetterboxInfo::new(640, 640, 640);
        let data = block(&[
            [100.0, 100.0, 20.0, 40.0, 0.9, 0.1],
            [300.0, 300.0, 20.0, 40.0, 0.2, 0.3],
        ]);
        let dets = decode_predictions(&data, 6, 2, &lb, 0.5, None);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x1 - 90.0).abs() < 1e-4);
        assert!((d.y1 - 80.0).abs() < 1e-4);
        assert!((d.x2 - 110.0).abs() < 1e-4);
        assert!((d.y2 - 120.0).abs() < 1e-4);
        assert!((d.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_respects_class_filter() {
        let lb = LetterboxInfo::new(640, 640, 640);
        let data = block(&[[100.0, 100.0, 20.0, 40.0, 0.9, 0.1]]);
        assert!(decode_predictions(&data, 6, 1, &lb, 0.5, Some(1)).is_empty());
        assert_eq!(decode_predictions(&data, 6, 1, &lb, 0.5, Some(0)).len(), 1);
        assert!(decode_predictions(&data, 6, 1, &lb, 0.5, Some(7)).is_empty());
    }

    #[test]
    fn test_decode_threshold_is_inclusive() {
        let lb = LetterboxInfo::new(640, 640, 640);
        let data = block(&[[100.0, 100.0, 20.0, 40.0, 0.5, 0.0]]);
        assert_eq!(decode_predictions(&data, 6, 1, &lb, 0.5, None).len(), 1);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let image = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 0]));
        let (tensor, lb) = YoloBoxDetector::preprocess(&image, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.pad_y, 16.0);

        let fill = YOLO_LETTERBOX_FILL as f32 / 255.0;
        // Padding band above the image.
        assert!((tensor[[0, 0, 0, 10]] - fill).abs() < 1e-6);
        // Image interior: pure red.
        assert!((tensor[[0, 0, 32, 10]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 32, 10]].abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let detector = YoloBoxDetector::new("/nonexistent/reference.onnx", YOLO_INPUT_SIZE, None);
        let image = RgbImage::new(8, 8);
        let err = detector.detect(&image, 0.5).unwrap_err();
        assert!(matches!(err, DetectorError::ModelLoad(_)));
    }

    #[test]
    fn test_zero_input_size_rejected_before_load() {
        let detector = YoloBoxDetector::new("/nonexistent/reference.onnx", 0, None);
        let err = detector.detect(&RgbImage::new(8, 8), 0.5).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidInputSize(0)));
    }

    #[test]
    fn test_empty_image_rejected_before_load() {
        let detector = YoloBoxDetector::new("/nonexistent/reference.onnx", YOLO_INPUT_SIZE, None);
        let err = detector.detect(&RgbImage::new(0, 0), 0.5).unwrap_err();
        assert!(matches!(err, DetectorError::EmptyImage { .. }));
    }
}
