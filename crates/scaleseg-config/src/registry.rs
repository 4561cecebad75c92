use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};

type BuildFn<T, E> = Box<dyn Fn(&Value) -> Result<T, E> + Send + Sync>;

/// Name-keyed builders: `{"type": "RandomFlip", "prob": 0.5}` resolves
/// `RandomFlip` and hands the whole entry to its builder.
pub struct Registry<T, E> {
    name: String,
    builders: BTreeMap<String, BuildFn<T, E>>,
}

impl<T, E: From<ConfigError>> Registry<T, E> {
    pub fn new(name: &str) -> Self {
        Registry {
            name: name.to_string(),
            builders: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register<F>(&mut self, type_name: &str, build: F) -> ConfigResult<()>
    where
        F: Fn(&Value) -> Result<T, E> + Send + Sync + 'static,
    {
        if self.builders.contains_key(type_name) {
            return Err(ConfigError::DuplicateType {
                registry: self.name.clone(),
                name: type_name.to_string(),
            });
        }
        self.builders.insert(type_name.to_string(), Box::new(build));
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.builders.contains_key(type_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Build one entry.
    pub fn build(&self, cfg: &Value) -> Result<T, E> {
        let type_name = cfg
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::MissingType(cfg.to_string()))?;
        let build = self.builders.get(type_name).ok_or_else(|| ConfigError::UnknownType {
            registry: self.name.clone(),
            name: type_name.to_string(),
        })?;
        build(cfg)
    }

    /// Build every entry of a JSON array, in order.
    pub fn build_all(&self, cfgs: &Value) -> Result<Vec<T>, E> {
        let items = cfgs
            .as_array()
            .ok_or_else(|| ConfigError::Invalid(format!("{} list must be an array", self.name)))?;
        items.iter().map(|cfg| self.build(cfg)).collect()
    }
}

/// Deserialize a registry entry into its parameter struct, ignoring `type`.
pub fn params<P: DeserializeOwned>(cfg: &Value) -> ConfigResult<P> {
    let mut body = cfg.clone();
    let type_name = match body.as_object_mut().and_then(|m| m.remove("type")) {
        Some(Value::String(s)) => s,
        _ => String::from("<untyped>"),
    };
    serde_json::from_value(body).map_err(|source| ConfigError::Deserialize {
        key: type_name,
        source,
    })
}
