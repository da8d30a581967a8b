//! stature-core — Human height estimation from a single image.
//!
//! A reference object of known height calibrates pixels to centimetres, pose
//! landmarks are turned into body segment lengths, and an optional regression
//! model refines the result. Detection runs through ONNX Runtime on the CPU.

pub mod artifact;
pub mod config;
pub mod correction;
pub mod detector;
pub mod geometry;
pub mod height;
pub mod landmarks;
pub mod pipeline;
pub mod pose;
pub mod scale;
pub mod types;

pub use config::{default_model_dir, PipelineConfig};
pub use correction::{CorrectionMode, HeightCorrector};
pub use height::{GeometryMode, HeightCalculator, HeightInput, MalformedPosePolicy};
pub use landmarks::{BodyPart, Landmark, Pose};
pub use pipeline::{ErrorKind, EstimateSink, HeightPipeline, PipelineError, PipelineOutput, PipelineRequest};
pub use types::{Detection, HeightEstimate, HeightReport, ScaleReading};
