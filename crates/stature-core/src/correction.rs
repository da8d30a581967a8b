//! Height correction models.
//!
//! Maps a row of segment distances to a refined height. Three strategies are
//! interchangeable behind [`HeightCorrector::process`]:
//!
//! - `LINEAR`: ordinary least squares, stored as JSON coefficients.
//! - `RANDOM_FOREST`: a regression forest, stored as JSON node arrays in the
//!   layout scikit-learn uses for its fitted trees.
//! - `NEURAL_NET`: a small MLP exported to ONNX, run through ONNX Runtime.
//!
//! Each artifact loads on first use and stays cached, failures included.

use crate::artifact::{load_onnx_session, LazyArtifact, ModelLoadError};
use crate::config::{ConfigError, CorrectionConfig};
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Marks a leaf in the forest's child arrays.
const TREE_LEAF: i64 = -1;

#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error("feature row {row} has {got} values, model expects {expected}")]
    FeatureLength {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionMode {
    Linear,
    RandomForest,
    NeuralNet,
}

impl FromStr for CorrectionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LINEAR" => Ok(Self::Linear),
            "RANDOM_FOREST" => Ok(Self::RandomForest),
            "NEURAL_NET" | "NN" => Ok(Self::NeuralNet),
            _ => Err(ConfigError::UnknownMode {
                setting: "correction.mode",
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for CorrectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Linear => "LINEAR",
            Self::RandomForest => "RANDOM_FOREST",
            Self::NeuralNet => "NEURAL_NET",
        })
    }
}

/// A fitted model that can be read from disk and evaluated row by row.
pub trait Regressor: Sized + Send + Sync {
    fn load(path: &Path) -> Result<Self, ModelLoadError>;
    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, CorrectionError>;
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ModelLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ModelLoadError::new(path, e))?;
    serde_json::from_str(&raw).map_err(|e| ModelLoadError::new(path, e))
}

fn check_row_len(row: usize, values: &[f64], expected: usize) -> Result<(), CorrectionError> {
    if values.len() != expected {
        return Err(CorrectionError::FeatureLength {
            row,
            expected,
            got: values.len(),
        });
    }
    Ok(())
}

/// `y = coefficients · x + intercept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl Regressor for LinearModel {
    fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let model: Self = read_json(path)?;
        if model.coefficients.is_empty() {
            return Err(ModelLoadError::new(path, "linear model has no coefficients"));
        }
        if !model.intercept.is_finite() || model.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelLoadError::new(path, "linear model has non-finite parameters"));
        }
        Ok(model)
    }

    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, CorrectionError> {
        features
            .iter()
            .enumerate()
            .map(|(row, x)| {
                check_row_len(row, x, self.coefficients.len())?;
                let dot: f64 = self.coefficients.iter().zip(x).map(|(c, v)| c * v).sum();
                Ok(dot + self.intercept)
            })
            .collect()
    }
}

/// One regression tree as parallel node arrays.
///
/// Node `i` is a leaf when `children_left[i] == -1`; otherwise samples with
/// `x[feature[i]] <= threshold[i]` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub value: Vec<f64>,
}

impl RegressionTree {
    /// Structural checks that guarantee `evaluate` terminates and never indexes out of bounds.
    fn validate(&self, n_features: usize) -> Result<(), String> {
        let n = self.children_left.len();
        if n == 0 {
            return Err("tree has no nodes".into());
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err("tree node arrays differ in length".into());
        }

        for node in 0..n {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == TREE_LEAF {
                continue;
            }
            // Children always follow their parent, which rules out cycles.
            for child in [left, right] {
                if child <= node as i64 || child >= n as i64 {
                    return Err(format!("node {node} has invalid child {child}"));
                }
            }
            let f = self.feature[node];
            if f < 0 || f as usize >= n_features {
                return Err(format!("node {node} splits on invalid feature {f}"));
            }
        }
        Ok(())
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        let mut node = 0usize;
        while self.children_left[node] != TREE_LEAF {
            let f = self.feature[node] as usize;
            node = if x[f] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        self.value[node]
    }
}

/// Averaged ensemble of regression trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub n_features: usize,
    pub trees: Vec<RegressionTree>,
}

impl Regressor for ForestModel {
    fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let model: Self = read_json(path)?;
        if model.trees.is_empty() {
            return Err(ModelLoadError::new(path, "forest has no trees"));
        }
        for (i, tree) in model.trees.iter().enumerate() {
            tree.validate(model.n_features)
                .map_err(|reason| ModelLoadError::new(path, format!("tree {i}: {reason}")))?;
        }
        tracing::debug!(trees = model.trees.len(), n_features = model.n_features, "forest validated");
        Ok(model)
    }

    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, CorrectionError> {
        features
            .iter()
            .enumerate()
            .map(|(row, x)| {
                check_row_len(row, x, self.n_features)?;
                let total: f64 = self.trees.iter().map(|t| t.evaluate(x)).sum();
                Ok(total / self.trees.len() as f64)
            })
            .collect()
    }
}

/// MLP regressor exported to ONNX: `[N, F]` float input, `[N, 1]` output.
pub struct HeightNet {
    session: Mutex<Session>,
}

impl Regressor for HeightNet {
    fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = load_onnx_session(path)?;

        tracing::info!(
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded height net model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, CorrectionError> {
        let cols = features.first().map(Vec::len).unwrap_or(0);
        for (row, x) in features.iter().enumerate() {
            check_row_len(row, x, cols)?;
        }

        let flat: Vec<f32> = features.iter().flatten().map(|&v| v as f32).collect();
        let input = Array2::from_shape_vec((features.len(), cols), flat)
            .map_err(|e| CorrectionError::InferenceFailed(format!("input tensor: {e}")))?;

        let ort_err = |e: ort::Error| CorrectionError::InferenceFailed(e.to_string());

        let mut session = self
            .session
            .lock()
            .map_err(|_| CorrectionError::InferenceFailed("height net session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![TensorRef::from_array_view(input.view()).map_err(ort_err)?])
            .map_err(ort_err)?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| CorrectionError::InferenceFailed(format!("prediction: {e}")))?;

        if data.len() != features.len() {
            return Err(CorrectionError::InferenceFailed(format!(
                "expected {} predictions, got {}",
                features.len(),
                data.len()
            )));
        }

        Ok(data.iter().map(|&v| v as f64).collect())
    }
}

/// Correction strategy selected once from configuration.
#[derive(Debug)]
pub enum HeightCorrector {
    Linear(LazyArtifact<LinearModel>),
    RandomForest(LazyArtifact<ForestModel>),
    NeuralNet(LazyArtifact<HeightNet>),
}

impl HeightCorrector {
    pub fn new(mode: CorrectionMode, artifact_path: impl Into<std::path::PathBuf>) -> Self {
        let path = artifact_path.into();
        match mode {
            CorrectionMode::Linear => Self::Linear(LazyArtifact::new(path)),
            CorrectionMode::RandomForest => Self::RandomForest(LazyArtifact::new(path)),
            CorrectionMode::NeuralNet => Self::NeuralNet(LazyArtifact::new(path)),
        }
    }

    /// Build the strategy named by `config.mode`. Nothing is loaded yet.
    pub fn from_config(config: &CorrectionConfig) -> Result<Self, ConfigError> {
        let mode: CorrectionMode = config.mode.parse()?;
        let path = match mode {
            CorrectionMode::Linear => &config.linear_path,
            CorrectionMode::RandomForest => &config.random_forest_path,
            CorrectionMode::NeuralNet => &config.neural_net_path,
        };
        tracing::info!(%mode, path = %path.display(), "height corrector configured");
        Ok(Self::new(mode, path.clone()))
    }

    pub fn mode(&self) -> CorrectionMode {
        match self {
            Self::Linear(_) => CorrectionMode::Linear,
            Self::RandomForest(_) => CorrectionMode::RandomForest,
            Self::NeuralNet(_) => CorrectionMode::NeuralNet,
        }
    }

    pub fn is_loaded(&self) -> bool {
        match self {
            Self::Linear(a) => a.is_initialized(),
            Self::RandomForest(a) => a.is_initialized(),
            Self::NeuralNet(a) => a.is_initialized(),
        }
    }

    /// One corrected height per feature row.
    pub fn process(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, CorrectionError> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let predictions = match self {
            Self::Linear(a) => predict_with(a, features),
            Self::RandomForest(a) => predict_with(a, features),
            Self::NeuralNet(a) => predict_with(a, features),
        }?;
        tracing::debug!(mode = %self.mode(), rows = features.len(), "height correction applied");
        Ok(predictions)
    }
}

/// Model input rows: the leading `count` segment distances of each person.
pub fn feature_rows(distances: &[[f64; 7]], count: usize) -> Vec<Vec<f64>> {
    let count = count.min(7);
    distances.iter().map(|d| d[..count].to_vec()).collect()
}

fn predict_with<R: Regressor>(
    artifact: &LazyArtifact<R>,
    features: &[Vec<f64>],
) -> Result<Vec<f64>, CorrectionError> {
    artifact.get_or_load(R::load)?.predict(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    /// Depth-1 tree: x[0] <= 10 -> 150, else 180.
    const STUMP: &str = r#"{
        "children_left": [1, -1, -1],
        "children_right": [2, -1, -1],
        "feature": [0, -2, -2],
        "threshold": [10.0, -2.0, -2.0],
        "value": [165.0, 150.0, 180.0]
    }"#;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("linear".parse::<CorrectionMode>().unwrap(), CorrectionMode::Linear);
        assert_eq!("RANDOM_FOREST".parse::<CorrectionMode>().unwrap(), CorrectionMode::RandomForest);
        assert_eq!("neural_net".parse::<CorrectionMode>().unwrap(), CorrectionMode::NeuralNet);
    }

    #[test]
    fn test_unknown_mode_is_configuration_error() {
        let config = CorrectionConfig {
            mode: "GRADIENT_BOOST".into(),
            ..CorrectionConfig::default()
        };
        let err = HeightCorrector::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMode { setting: "correction.mode", .. }));
    }

    #[test]
    fn test_linear_predicts_each_row() {
        let file = artifact(r#"{"coefficients": [1.0, 2.0, 0.5], "intercept": 10.0}"#);
        let corrector = HeightCorrector::new(CorrectionMode::Linear, file.path());
        let preds = corrector
            .process(&[vec![1.0, 1.0, 2.0], vec![0.0, 0.0, 0.0]])
            .unwrap();
        assert_eq!(preds.len(), 2);
        assert!((preds[0] - 14.0).abs() < 1e-12);
        assert!((preds[1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_rejects_wrong_feature_count() {
        let file = artifact(r#"{"coefficients": [1.0, 2.0], "intercept": 0.0}"#);
        let corrector = HeightCorrector::new(CorrectionMode::Linear, file.path());
        let err = corrector.process(&[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            CorrectionError::FeatureLength { row: 1, expected: 2, got: 1 }
        ));
    }

    #[test]
    fn test_forest_averages_trees() {
        let json = format!(
            r#"{{"n_features": 2, "trees": [{STUMP}, {{
                "children_left": [-1], "children_right": [-1], "feature": [-2],
                "threshold": [-2.0], "value": [170.0]
            }}]}}"#
        );
        let file = artifact(&json);
        let corrector = HeightCorrector::new(CorrectionMode::RandomForest, file.path());
        let preds = corrector
            .process(&[vec![5.0, 0.0], vec![10.0, 0.0], vec![11.0, 0.0]])
            .unwrap();
        assert_eq!(preds, vec![160.0, 160.0, 175.0]);
    }

    #[test]
    fn test_forest_rejects_cyclic_tree() {
        let file = artifact(
            r#"{"n_features": 1, "trees": [{
                "children_left": [0], "children_right": [0], "feature": [0],
                "threshold": [1.0], "value": [0.0]
            }]}"#,
        );
        let corrector = HeightCorrector::new(CorrectionMode::RandomForest, file.path());
        let err = corrector.process(&[vec![1.0]]).unwrap_err();
        assert!(matches!(err, CorrectionError::ModelLoad(_)));
    }

    #[test]
    fn test_forest_rejects_out_of_range_feature() {
        let file = artifact(&format!(r#"{{"n_features": 0, "trees": [{STUMP}]}}"#));
        let corrector = HeightCorrector::new(CorrectionMode::RandomForest, file.path());
        assert!(matches!(
            corrector.process(&[vec![]]).unwrap_err(),
            CorrectionError::ModelLoad(_)
        ));
    }

    #[test]
    fn test_corrupt_artifact_is_model_load_error() {
        let file = artifact("not json at all");
        let corrector = HeightCorrector::new(CorrectionMode::Linear, file.path());
        assert!(matches!(
            corrector.process(&[vec![1.0]]).unwrap_err(),
            CorrectionError::ModelLoad(_)
        ));
    }

    #[test]
    fn test_missing_artifact_fails_once_and_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.json");
        let corrector = HeightCorrector::new(CorrectionMode::Linear, &path);

        assert!(matches!(
            corrector.process(&[vec![1.0]]).unwrap_err(),
            CorrectionError::ModelLoad(_)
        ));

        // The artifact appearing later does not trigger a reload.
        std::fs::write(&path, r#"{"coefficients": [1.0], "intercept": 0.0}"#).unwrap();
        assert!(matches!(
            corrector.process(&[vec![1.0]]).unwrap_err(),
            CorrectionError::ModelLoad(_)
        ));
    }

    #[test]
    fn test_missing_neural_net_is_model_load_error() {
        let corrector = HeightCorrector::new(CorrectionMode::NeuralNet, "/nonexistent/height_net.onnx");
        assert!(matches!(
            corrector.process(&[vec![1.0; 6]]).unwrap_err(),
            CorrectionError::ModelLoad(_)
        ));
    }

    #[test]
    fn test_feature_rows_take_leading_segments() {
        let distances = [[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]];
        assert_eq!(feature_rows(&distances, 6), vec![vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]);
        assert_eq!(feature_rows(&distances, 9)[0].len(), 7);
    }

    #[test]
    fn test_empty_batch_does_not_load() {
        let corrector = HeightCorrector::new(CorrectionMode::Linear, "/nonexistent/linear.json");
        assert!(corrector.process(&[]).unwrap().is_empty());
        assert!(!corrector.is_loaded());
    }
}
