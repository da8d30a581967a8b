//! Pose landmark sources.
//!
//! The landmark model itself runs outside this crate. Anything that can hand
//! back normalized 33-point poses for a frame implements [`PoseLandmarker`].

use crate::landmarks::Pose;
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoseError {
    #[error("failed to read landmarks from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed landmark document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("landmark extraction failed: {0}")]
    Extraction(String),
}

/// Supplies every detected person's landmarks for a frame.
pub trait PoseLandmarker: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Pose>, PoseError>;
}

/// Serialized output of a pose landmark service.
///
/// Accepts either `{"pose_landmarks": [[{x, y, z}, ...], ...], "img_width": .., "img_height": ..}`
/// or a bare list of poses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum LandmarkDocument {
    Envelope {
        pose_landmarks: Vec<Pose>,
        #[serde(default)]
        img_width: Option<f64>,
        #[serde(default)]
        img_height: Option<f64>,
    },
    Bare(Vec<Pose>),
}

/// Landmarks loaded ahead of time from a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPoseSource {
    poses: Vec<Pose>,
    /// Frame size recorded alongside the landmarks, if any.
    dimensions: Option<(f64, f64)>,
}

impl JsonPoseSource {
    pub fn from_json(json: &str) -> Result<Self, PoseError> {
        let doc: LandmarkDocument = serde_json::from_str(json)?;
        Ok(match doc {
            LandmarkDocument::Envelope {
                pose_landmarks,
                img_width,
                img_height,
            } => Self {
                poses: pose_landmarks,
                dimensions: img_width.zip(img_height),
            },
            LandmarkDocument::Bare(poses) => Self {
                poses,
                dimensions: None,
            },
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, PoseError> {
        let json = std::fs::read_to_string(path).map_err(|source| PoseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let source = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            persons = source.poses.len(),
            "landmarks loaded"
        );
        Ok(source)
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn dimensions(&self) -> Option<(f64, f64)> {
        self.dimensions
    }
}

impl PoseLandmarker for JsonPoseSource {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<Pose>, PoseError> {
        if self.poses.is_empty() {
            tracing::warn!("no pose landmarks detected");
        }
        Ok(self.poses.clone())
    }
}
