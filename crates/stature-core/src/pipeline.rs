//! End-to-end height estimation for one image.
//!
//! Stages run in order: reference scale, pose landmarks, height geometry,
//! optional correction, optional sinks. A failing stage is logged with its
//! name and the request filename and the error is returned as-is.

use crate::config::{ConfigError, PipelineConfig};
use crate::correction::{feature_rows, CorrectionError, HeightCorrector};
use crate::detector::{BoxDetector, DetectorError, YoloBoxDetector};
use crate::height::{HeightCalculator, HeightError, HeightInput};
use crate::pose::{PoseError, PoseLandmarker};
use crate::scale::{ReferenceScaleDetector, ScaleError};
use crate::types::{HeightReport, ScaleReading};
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Failure category a caller can map to a distinct response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// No usable reference object in the frame.
    DetectionEmpty,
    /// The image, landmarks or feature rows cannot be measured.
    MalformedInput,
    /// A mode string or setting is invalid.
    ConfigurationError,
    /// A model artifact is missing or corrupt.
    ModelLoadError,
    /// A loaded model failed while running.
    InferenceError,
    /// A downstream sink rejected the result.
    SinkError,
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SinkError(pub String);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("no reference object detected")]
    DetectionEmpty,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Pose(#[from] PoseError),
    #[error(transparent)]
    Height(#[from] HeightError),
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error("sink {sink}: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyImage { .. } | Self::Height(_) => ErrorKind::MalformedInput,
            Self::DetectionEmpty => ErrorKind::DetectionEmpty,
            Self::Config(_) => ErrorKind::ConfigurationError,
            Self::Scale(ScaleError::InvalidReferenceHeight(_)) => ErrorKind::ConfigurationError,
            Self::Scale(ScaleError::Detector(e)) => match e {
                DetectorError::ModelLoad(_) => ErrorKind::ModelLoadError,
                DetectorError::EmptyImage { .. } => ErrorKind::MalformedInput,
                DetectorError::InvalidInputSize(_) => ErrorKind::ConfigurationError,
                DetectorError::InferenceFailed(_) | DetectorError::Ort(_) => ErrorKind::InferenceError,
            },
            Self::Pose(PoseError::Extraction(_)) => ErrorKind::InferenceError,
            Self::Pose(_) => ErrorKind::MalformedInput,
            Self::Correction(e) => match e {
                CorrectionError::ModelLoad(_) => ErrorKind::ModelLoadError,
                CorrectionError::FeatureLength { .. } => ErrorKind::MalformedInput,
                CorrectionError::InferenceFailed(_) => ErrorKind::InferenceError,
            },
            Self::Sink { .. } => ErrorKind::SinkError,
        }
    }
}

/// One image to measure.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub image: RgbImage,
    /// Identifies the request in logs and sink output.
    pub filename: String,
}

impl PipelineRequest {
    pub fn new(image: RgbImage, filename: impl Into<String>) -> Self {
        Self {
            image,
            filename: filename.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub filename: String,
    pub scale: ScaleReading,
    pub report: HeightReport,
    /// Model-refined heights, one per person, when correction is enabled.
    pub corrected: Option<Vec<f64>>,
    /// Annotated image written by a visualization sink.
    pub annotated_path: Option<PathBuf>,
}

/// Downstream consumer of finished estimates (visualization, tabular export).
pub trait EstimateSink: Send + Sync {
    fn name(&self) -> &str;

    /// Consume one result. Sinks that write an annotated image return its path.
    fn record(
        &self,
        request: &PipelineRequest,
        output: &PipelineOutput,
    ) -> Result<Option<PathBuf>, SinkError>;
}

/// Log a failed stage with request context and convert the error.
fn stage<T, E>(stage: &'static str, filename: &str, result: Result<T, E>) -> Result<T, PipelineError>
where
    E: Into<PipelineError> + std::fmt::Display,
{
    result.map_err(|e| {
        tracing::error!(stage, filename, error = %e, "pipeline stage failed");
        e.into()
    })
}

pub struct HeightPipeline<D> {
    scale: ReferenceScaleDetector<D>,
    calculator: HeightCalculator,
    corrector: Option<HeightCorrector>,
    feature_count: usize,
    sinks: Vec<Box<dyn EstimateSink>>,
}

impl HeightPipeline<YoloBoxDetector> {
    /// Pipeline backed by the ONNX reference detector named in `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let r = &config.reference;
        let detector = YoloBoxDetector::new(&r.model_path, r.input_size, r.class_id);
        Self::new(detector, config)
    }
}

impl<D: BoxDetector> HeightPipeline<D> {
    /// Validate every mode string and wire the stages. No model is loaded here.
    pub fn new(detector: D, config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let scale = ReferenceScaleDetector::new(
            detector,
            config.reference.height_cm,
            config.reference.confidence,
        )?;
        let calculator = HeightCalculator::new(config.geometry_mode()?, config.malformed_pose_policy()?);
        let corrector = if config.correction.enabled {
            Some(HeightCorrector::from_config(&config.correction)?)
        } else {
            None
        };

        tracing::info!(
            geometry = %calculator.mode(),
            correction = ?corrector.as_ref().map(HeightCorrector::mode),
            reference_cm = config.reference.height_cm,
            threshold = config.reference.confidence,
            "height pipeline ready"
        );

        Ok(Self {
            scale,
            calculator,
            corrector,
            feature_count: config.correction.features,
            sinks: Vec::new(),
        })
    }

    pub fn with_sink(mut self, sink: impl EstimateSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn calculator(&self) -> &HeightCalculator {
        &self.calculator
    }

    pub fn corrector(&self) -> Option<&HeightCorrector> {
        self.corrector.as_ref()
    }

    /// Run every stage for one request.
    ///
    /// `landmarker` supplies the poses for this request's image.
    pub fn process<P>(&self, request: &PipelineRequest, landmarker: &P) -> Result<PipelineOutput, PipelineError>
    where
        P: PoseLandmarker + ?Sized,
    {
        let filename = request.filename.as_str();
        let image = &request.image;
        let (width, height) = image.dimensions();

        if width == 0 || height == 0 {
            return stage("input", filename, Err(PipelineError::EmptyImage { width, height }));
        }

        let scale = stage("reference_scale", filename, self.scale.process(image))?;
        if !scale.is_valid() {
            return stage("reference_scale", filename, Err(PipelineError::DetectionEmpty));
        }
        tracing::debug!(filename, pixel_per_cm = scale.pixel_per_cm, "scale stage complete");

        let poses = stage("pose", filename, landmarker.detect(image))?;
        tracing::debug!(filename, persons = poses.len(), "pose stage complete");

        let input = HeightInput {
            poses: &poses,
            img_width: width as f64,
            img_height: height as f64,
            pixel_per_cm: scale.pixel_per_cm,
        };
        let report = stage("height", filename, self.calculator.process(&input))?;

        let corrected = match &self.corrector {
            Some(corrector) => {
                let rows = feature_rows(&report.distances, self.feature_count);
                Some(stage("correction", filename, corrector.process(&rows))?)
            }
            None => None,
        };

        let mut output = PipelineOutput {
            filename: request.filename.clone(),
            scale,
            report,
            corrected,
            annotated_path: None,
        };

        for sink in &self.sinks {
            let recorded = sink.record(request, &output).map_err(|source| PipelineError::Sink {
                sink: sink.name().to_string(),
                source,
            });
            if let Some(path) = stage("sink", filename, recorded)? {
                output.annotated_path.get_or_insert(path);
            }
        }

        tracing::info!(
            filename,
            persons = output.report.len(),
            heights = ?output.report.heights,
            "height estimation complete"
        );

        Ok(output)
    }
}
