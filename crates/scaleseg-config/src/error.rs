use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for `{key}`: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing config key `{0}`")]
    MissingKey(String),

    #[error("`_base_` inheritance cycle through {0}")]
    BaseCycle(PathBuf),

    #[error("config entry has no string `type` field: {0}")]
    MissingType(String),

    #[error("`{name}` is not registered in the {registry} registry")]
    UnknownType { registry: String, name: String },

    #[error("`{name}` is already registered in the {registry} registry")]
    DuplicateType { registry: String, name: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
