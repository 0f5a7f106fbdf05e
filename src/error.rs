use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while estimating lighting from a capture.
///
/// Correspondence rejections are not errors; they travel through the pipeline as NaN samples.
#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("malformed capture: {0}")]
    MalformedCapture(String),

    #[error("no mesh ending in '{suffix}' found in {dir}")]
    MissingMesh { dir: PathBuf, suffix: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("compute kernel '{kernel}': {message}")]
    Kernel {
        kernel: &'static str,
        message: String,
    },

    #[error("solver error: {0}")]
    Solver(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("render device error: {0}")]
    Render(String),

    #[error("mesh already carries a radiance attribute")]
    RadianceAlreadySet,

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<EstimateError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("OBJ error: {0}")]
    Obj(#[from] tobj::LoadError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EstimateError {
    /// Tags the error with the pipeline stage it escaped from.
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            // Already tagged by an inner stage.
            EstimateError::Stage { .. } => self,
            other => EstimateError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        EstimateError::MalformedCapture(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EstimateError>;
