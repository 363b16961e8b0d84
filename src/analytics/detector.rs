use opencv::core::Mat;
use thiserror::Error;

use super::detection::{DetectParams, Detection};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("unsupported model output: {0}")]
    UnsupportedOutput(String),
    #[error("failed to load model '{name}': {reason}")]
    Load { name: String, reason: String },
}

/// Not required to be thread-safe; [`super::ModelPool`] serializes calls per instance.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Mat, params: &DetectParams)
        -> Result<Vec<Detection>, DetectorError>;
}

pub trait DetectorFactory: Send + Sync {
    fn load(&self, model_name: &str) -> Result<Box<dyn Detector>, DetectorError>;
}
