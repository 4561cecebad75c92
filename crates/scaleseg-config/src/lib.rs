//! JSON experiment configs with `_base_` inheritance, and the name-keyed
//! registries that turn config entries into components.

pub mod config;
pub mod error;
pub mod registry;

pub use config::{merge, Config};
pub use error::{ConfigError, ConfigResult};
pub use registry::{params, Registry};
