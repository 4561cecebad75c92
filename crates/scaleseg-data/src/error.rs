use std::path::PathBuf;

use scaleseg_config::ConfigError;
use scaleseg_core::TensorError;
use scaleseg_transforms::TransformError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot list {dir}: {source}")]
    Walk {
        dir: PathBuf,
        source: walkdir::Error,
    },

    #[error("no `{suffix}` files under {dir}")]
    NoSamples { dir: PathBuf, suffix: String },

    #[error("index {index} out of range for a dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("sample {index} has {what} shape {got:?}, batch started with {expected:?}")]
    BatchMismatch {
        index: usize,
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid loader setting: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type DataResult<T> = Result<T, DataError>;
