use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

const BASE_KEY: &str = "_base_";
const DELETE_KEY: &str = "_delete_";

/// A JSON experiment configuration.
///
/// Files may inherit from other files through a `_base_` key holding a path
/// or a list of paths, resolved relative to the including file. Bases are
/// merged in order and the including file is merged on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: Value,
    filename: Option<PathBuf>,
}

impl Config {
    pub fn from_value(root: Value) -> Self {
        Config {
            root,
            filename: None,
        }
    }

    pub fn from_str(text: &str) -> ConfigResult<Self> {
        let root = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        Ok(Self::from_value(root))
    }

    /// Load a config file and resolve its `_base_` chain.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let mut stack = Vec::new();
        let root = load_resolved(path, &mut stack)?;
        Ok(Config {
            root,
            filename: Some(path.to_path_buf()),
        })
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Look up a dotted key such as `model.backbone.layers`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.root, |node, part| node.get(part))
    }

    /// Deserialize the section at `key` into `T`.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> ConfigResult<T> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        T::deserialize(value).map_err(|source| ConfigError::Deserialize {
            key: key.to_string(),
            source,
        })
    }

    /// Set a dotted key, creating intermediate objects as needed.
    pub fn set(&mut self, key: &str, value: Value) -> ConfigResult<()> {
        let mut node = &mut self.root;
        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| ConfigError::Invalid("empty key".into()))?;
        for part in parents {
            let obj = node
                .as_object_mut()
                .ok_or_else(|| ConfigError::Invalid(format!("`{}` is not an object", key)))?;
            node = obj
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        node.as_object_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("`{}` is not an object", key)))?
            .insert(last.to_string(), value);
        Ok(())
    }

    /// Apply `key=value` overrides; values are parsed as JSON, falling back
    /// to a plain string.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> ConfigResult<()> {
        for item in overrides {
            let item = item.as_ref();
            let (key, raw) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::Invalid(format!("override `{}` is not key=value", item)))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            self.set(key.trim(), value)?;
        }
        Ok(())
    }

    /// Merge `other` on top of this config.
    pub fn merge_from(&mut self, other: Value) {
        merge(&mut self.root, other);
    }
}

/// Recursively merge `patch` into `base`.
///
/// Objects merge key by key unless the patch object carries `_delete_: true`,
/// in which case it replaces the base value. Everything else replaces.
pub fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(mut patch_map)) => {
            let delete = patch_map.remove(DELETE_KEY).and_then(|v| v.as_bool()).unwrap_or(false);
            if delete {
                if let Value::Object(stripped) = strip_delete(Value::Object(patch_map)) {
                    *base_map = stripped;
                }
                return;
            }
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, strip_delete(value));
                    }
                }
            }
        }
        (base, patch) => *base = strip_delete(patch),
    }
}

/// Remove every `_delete_` marker below `value`, including inside arrays.
fn strip_delete(mut value: Value) -> Value {
    match &mut value {
        Value::Object(map) => {
            map.remove(DELETE_KEY);
            for v in map.values_mut() {
                *v = strip_delete(v.take());
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                *v = strip_delete(v.take());
            }
        }
        _ => {}
    }
    value
}

fn read_json(path: &Path) -> ConfigResult<Value> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_resolved(path: &Path, stack: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if stack.contains(&canonical) {
        return Err(ConfigError::BaseCycle(canonical));
    }
    stack.push(canonical);

    let mut own = read_json(path)?;
    let bases = match own.as_object_mut().and_then(|m| m.remove(BASE_KEY)) {
        None => Vec::new(),
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(ConfigError::Invalid(format!("`_base_` entry {} is not a path", other))),
            })
            .collect::<ConfigResult<_>>()?,
        Some(other) => {
            return Err(ConfigError::Invalid(format!("`_base_` must be a path or list, got {}", other)))
        }
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Value::Object(Map::new());
    for base in bases {
        let base_path = dir.join(&base);
        debug!("config {} inherits {}", path.display(), base_path.display());
        let base_value = load_resolved(&base_path, stack)?;
        merge(&mut merged, base_value);
    }
    merge(&mut merged, own);

    stack.pop();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("scaleseg_config_{}", name));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_merge_nested() {
        let mut base = json!({"model": {"backbone": {"layers": [3, 4, 6, 3], "norm_eval": false}}});
        merge(&mut base, json!({"model": {"backbone": {"norm_eval": true}}}));
        assert_eq!(base["model"]["backbone"]["layers"], json!([3, 4, 6, 3]));
        assert_eq!(base["model"]["backbone"]["norm_eval"], json!(true));
    }

    #[test]
    fn test_merge_delete_replaces() {
        let mut base = json!({"backbone": {"type": "ResNet", "depth": 50}});
        merge(&mut base, json!({"backbone": {"_delete_": true, "type": "ScaleNet"}}));
        assert_eq!(base, json!({"backbone": {"type": "ScaleNet"}}));
    }

    #[test]
    fn test_merge_delete_strips_nested_markers() {
        let mut base = json!({"model": {"decode_head": {"type": "PSPHead", "pool_scales": [1, 2]}}});
        merge(
            &mut base,
            json!({"model": {"decode_head": {
                "_delete_": true,
                "type": "FCNHead",
                "loss_decode": {"_delete_": true, "type": "CrossEntropyLoss"},
                "extra": [{"_delete_": true, "k": 1}]
            }}}),
        );
        assert_eq!(
            base["model"]["decode_head"],
            json!({
                "type": "FCNHead",
                "loss_decode": {"type": "CrossEntropyLoss"},
                "extra": [{"k": 1}]
            })
        );
    }

    #[test]
    fn test_base_inheritance() {
        let dir = scratch_dir("inherit");
        fs::write(
            dir.join("base.json"),
            r#"{"model": {"backbone": {"type": "ScaleNet", "layers": [3, 4, 6, 3]},
                          "decode_head": {"loss_decode": {"pus_type": "none"}}}}"#,
        )
        .unwrap();
        fs::write(
            dir.join("child.json"),
            r#"{"_base_": "./base.json",
                "model": {"backbone": {"layers": [3, 4, 23, 3]},
                          "decode_head": {"loss_decode": {"pus_type": "clamp", "pus_beta": 0.8, "pus_k": 0.8}}}}"#,
        )
        .unwrap();

        let cfg = Config::from_file(dir.join("child.json")).unwrap();
        assert_eq!(cfg.get("model.backbone.type"), Some(&json!("ScaleNet")));
        assert_eq!(cfg.get("model.backbone.layers"), Some(&json!([3, 4, 23, 3])));
        assert_eq!(cfg.get("model.decode_head.loss_decode.pus_beta"), Some(&json!(0.8)));
        assert!(cfg.get(BASE_KEY).is_none());
    }

    #[test]
    fn test_base_cycle_detected() {
        let dir = scratch_dir("cycle");
        fs::write(dir.join("a.json"), r#"{"_base_": "b.json"}"#).unwrap();
        fs::write(dir.join("b.json"), r#"{"_base_": ["a.json"]}"#).unwrap();
        assert!(matches!(Config::from_file(dir.join("a.json")), Err(ConfigError::BaseCycle(_))));
    }

    #[test]
    fn test_section_and_overrides() {
        let mut cfg = Config::from_str(r#"{"data": {"samples_per_gpu": 2}}"#).unwrap();
        cfg.apply_overrides(&["data.samples_per_gpu=4", "work_dir=runs/a"]).unwrap();
        let n: usize = cfg.section("data.samples_per_gpu").unwrap();
        assert_eq!(n, 4);
        assert_eq!(cfg.get("work_dir"), Some(&json!("runs/a")));
        assert!(matches!(cfg.section::<usize>("data.missing"), Err(ConfigError::MissingKey(_))));
        assert!(matches!(cfg.section::<usize>("work_dir"), Err(ConfigError::Deserialize { .. })));
    }
}
