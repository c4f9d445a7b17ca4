//! Error types for network construction, training and checkpointing.

use npr_data::DataError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid {kind} '{value}'")]
    InvalidMode { kind: &'static str, value: String },

    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("{context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("batch is missing feature '{0}'")]
    MissingFeature(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("dataset '{0}' is empty")]
    EmptyDataset(String),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        got: impl std::fmt::Display,
    ) -> Self {
        TrainError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
