//! Load-once model artifacts.
//!
//! The first caller runs the loader; concurrent callers block on the same
//! initialization. The outcome, success or failure, is cached for the life of
//! the process and never retried.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// A model artifact could not be read or parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to load model artifact {path}: {reason}")]
pub struct ModelLoadError {
    pub path: String,
    pub reason: String,
}

impl ModelLoadError {
    pub fn new(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub struct LazyArtifact<T> {
    path: PathBuf,
    cell: OnceLock<Result<T, ModelLoadError>>,
}

impl<T> LazyArtifact<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a load has been attempted, regardless of outcome.
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Return the cached artifact, running `load` on first access only.
    pub fn get_or_load<F>(&self, load: F) -> Result<&T, ModelLoadError>
    where
        F: FnOnce(&Path) -> Result<T, ModelLoadError>,
    {
        self.cell
            .get_or_init(|| {
                if !self.path.exists() {
                    return Err(ModelLoadError::new(&self.path, "file not found"));
                }
                let loaded = load(&self.path);
                match &loaded {
                    Ok(_) => tracing::info!(path = %self.path.display(), "model artifact loaded"),
                    Err(e) => tracing::error!(error = %e, "model artifact failed to load"),
                }
                loaded
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// Open an ONNX Runtime session for CPU inference.
pub fn load_onnx_session(path: &Path) -> Result<ort::session::Session, ModelLoadError> {
    fn open(path: &Path) -> Result<ort::session::Session, ort::Error> {
        Ok(ort::session::Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?)
    }
    open(path).map_err(|e| ModelLoadError::new(path, e))
}

impl<T> std::fmt::Debug for LazyArtifact<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyArtifact")
            .field("path", &self.path)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
