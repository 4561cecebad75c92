use std::path::PathBuf;

use scaleseg_config::ConfigError;
use scaleseg_core::TensorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid {transform} config: {reason}")]
    InvalidConfig { transform: &'static str, reason: String },

    #[error("results have no `{0}`")]
    MissingField(&'static str),

    #[error("{transform} cannot handle input: {reason}")]
    BadInput { transform: &'static str, reason: String },

    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("failed to decode label map {path}: {source}")]
    Png {
        path: PathBuf,
        source: png::DecodingError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type TransformResult<T> = Result<T, TransformError>;

pub(crate) fn invalid(transform: &'static str, reason: impl Into<String>) -> TransformError {
    TransformError::InvalidConfig {
        transform,
        reason: reason.into(),
    }
}

pub(crate) fn bad_input(transform: &'static str, reason: impl Into<String>) -> TransformError {
    TransformError::BadInput {
        transform,
        reason: reason.into(),
    }
}
