use std::path::PathBuf;

use scaleseg_config::ConfigError;
use scaleseg_core::TensorError;
use scaleseg_loss::LossError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read structure descriptor {path}: {source}")]
    StructureIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse structure descriptor {path}: {source}")]
    StructureParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid structure descriptor: {0}")]
    Structure(String),

    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loss(#[from] LossError),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type ModelResult<T> = Result<T, ModelError>;
