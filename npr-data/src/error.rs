//! Error types for decoding, splitting, caching and loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the data pipeline.
///
/// Per-sample decode oddities (short blob payloads, unknown extensions) are
/// logged instead of returned.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid blob header in {path}: {reason}")]
    BlobHeader { path: PathBuf, reason: String },

    #[error("unsupported bytes_per_channel {bytes_per_channel} in {path}")]
    BlobPrecision { path: PathBuf, bytes_per_channel: u32 },

    #[error("{0} contains no files")]
    EmptyDirectory(PathBuf),

    #[error("filename lists of '{reference}' and '{feature}' do not correspond: {reason}")]
    FilenameMismatch {
        reference: String,
        feature: String,
        reason: String,
    },

    #[error("feature '{feature}' has shape {got:?} after its init transform, expected {expected:?}")]
    ShapeMismatch {
        feature: String,
        expected: [usize; 2],
        got: [usize; 2],
    },

    #[error("array shape error: {0}")]
    ArrayShape(String),

    #[error("feature '{feature}' has no {split} transform; splitting requires both train and val transforms")]
    MissingTransform { feature: String, split: String },

    #[error("invalid cache file {path}: {reason}")]
    CacheFormat { path: PathBuf, reason: String },

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("no features registered")]
    NoFeatures,

    #[error("index {index} out of range for dataset of {len} frames")]
    IndexOutOfRange { index: usize, len: usize },
}

impl DataError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
