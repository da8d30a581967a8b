//! Pipeline configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `STATURE_*` environment variables.

use crate::correction::CorrectionMode;
use crate::detector::YOLO_INPUT_SIZE;
use crate::height::{GeometryMode, MalformedPosePolicy};
use crate::scale::DEFAULT_REFERENCE_HEIGHT_CM;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

// --- Named constants (no magic numbers) ---

/// Default minimum confidence for a reference object detection.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Feature counts the correction models were trained with.
pub const SUPPORTED_FEATURE_COUNTS: [usize; 2] = [6, 7];

const REFERENCE_MODEL_FILE: &str = "reference_box.onnx";
const LINEAR_MODEL_FILE: &str = "height_linear.json";
const RANDOM_FOREST_MODEL_FILE: &str = "height_random_forest.json";
const NEURAL_NET_MODEL_FILE: &str = "height_net.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown {setting} '{value}'")]
    UnknownMode { setting: &'static str, value: String },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Directory holding model artifacts: `$STATURE_MODEL_DIR`, else
/// `$XDG_DATA_HOME/stature/models`, else `~/.local/share/stature/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STATURE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("stature/models")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Physical height of the reference object.
    pub height_cm: f64,
    /// Detection confidence floor, also the suppression IoU threshold.
    pub confidence: f32,
    pub model_path: PathBuf,
    pub input_size: usize,
    /// Restrict detection to one class; `None` takes the best class per anchor.
    pub class_id: Option<usize>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            height_cm: DEFAULT_REFERENCE_HEIGHT_CM,
            confidence: DEFAULT_CONFIDENCE,
            model_path: default_model_dir().join(REFERENCE_MODEL_FILE),
            input_size: YOLO_INPUT_SIZE,
            class_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// `2D` or `3D`.
    pub mode: String,
    /// `abort` or `skip`.
    pub malformed_pose: String,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            mode: GeometryMode::TwoD.to_string(),
            malformed_pose: "abort".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    pub enabled: bool,
    /// `LINEAR`, `RANDOM_FOREST` or `NEURAL_NET`.
    pub mode: String,
    /// Leading segment distances fed to the model.
    pub features: usize,
    pub linear_path: PathBuf,
    pub random_forest_path: PathBuf,
    pub neural_net_path: PathBuf,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        let dir = default_model_dir();
        Self {
            enabled: false,
            mode: CorrectionMode::Linear.to_string(),
            features: 7,
            linear_path: dir.join(LINEAR_MODEL_FILE),
            random_forest_path: dir.join(RANDOM_FOREST_MODEL_FILE),
            neural_net_path: dir.join(NEURAL_NET_MODEL_FILE),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub reference: ReferenceConfig,
    pub geometry: GeometryConfig,
    pub correction: CorrectionConfig,
}

impl PipelineConfig {
    /// Defaults, overlaid with `path` if given, then with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(?config, "configuration resolved");
        Ok(config)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `STATURE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = &mut self.reference;
        env_parse(&lookup, "STATURE_REFERENCE_HEIGHT_CM", &mut r.height_cm)?;
        env_parse(&lookup, "STATURE_REFERENCE_CONFIDENCE", &mut r.confidence)?;
        env_parse(&lookup, "STATURE_REFERENCE_MODEL", &mut r.model_path)?;
        env_parse(&lookup, "STATURE_REFERENCE_INPUT_SIZE", &mut r.input_size)?;

        let g = &mut self.geometry;
        env_parse(&lookup, "STATURE_GEOMETRY_MODE", &mut g.mode)?;
        env_parse(&lookup, "STATURE_MALFORMED_POSE", &mut g.malformed_pose)?;

        let c = &mut self.correction;
        if let Some(v) = lookup("STATURE_CORRECTION_ENABLED") {
            c.enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env_parse(&lookup, "STATURE_CORRECTION_MODE", &mut c.mode)?;
        env_parse(&lookup, "STATURE_CORRECTION_FEATURES", &mut c.features)?;
        Ok(())
    }

    /// Reject settings that would only fail later, mid-pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry_mode()?;
        self.malformed_pose_policy()?;
        if self.correction.enabled {
            self.correction_mode()?;
        }
        if !SUPPORTED_FEATURE_COUNTS.contains(&self.correction.features) {
            return Err(ConfigError::InvalidValue {
                key: "correction.features".into(),
                value: self.correction.features.to_string(),
            });
        }
        if self.reference.input_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reference.input_size".into(),
                value: self.reference.input_size.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reference.confidence) {
            return Err(ConfigError::InvalidValue {
                key: "reference.confidence".into(),
                value: self.reference.confidence.to_string(),
            });
        }
        Ok(())
    }

    pub fn geometry_mode(&self) -> Result<GeometryMode, ConfigError> {
        self.geometry.mode.parse()
    }

    pub fn malformed_pose_policy(&self) -> Result<MalformedPosePolicy, ConfigError> {
        self.geometry.malformed_pose.parse()
    }

    pub fn correction_mode(&self) -> Result<CorrectionMode, ConfigError> {
        self.correction.mode.parse()
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.clone(),
    })?;
    Ok(())
}
