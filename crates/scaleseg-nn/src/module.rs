use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use scaleseg_core::{Tensor, TensorError, TensorResult};

use crate::norm::BatchNorm2D;

/// Named parameters and running buffers, keyed by dotted path
/// (`layer1.0.conv2.1.weight`).
pub type StateDict = BTreeMap<String, Tensor<f32>>;

/// Outcome of a non-strict [`Module::load_state_dict`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Present in the module, absent from the checkpoint.
    pub missing: Vec<String>,
    /// Present in the checkpoint, absent from the module.
    pub unexpected: Vec<String>,
    /// Present in both with different shapes; left untouched.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Join a parent prefix and a child name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// The base trait for all network modules.
///
/// Forward takes `&mut self` because batch-norm layers update their running
/// statistics while training.
pub trait Module: Send {
    /// Run the forward pass.
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>>;

    /// Call `f` with the full name of every parameter and buffer.
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>));

    /// Mutable counterpart of [`Module::visit`].
    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>));

    /// Switch between training and inference behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Call `f` on every batch-norm layer in this module tree.
    fn for_each_norm(&mut self, _f: &mut dyn FnMut(&mut BatchNorm2D)) {}

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.visit("", &mut |name, t| {
            state.insert(name, t.clone());
        });
        state
    }

    /// Number of scalars held in parameters and buffers.
    fn num_parameters(&self) -> usize {
        let mut n = 0;
        self.visit("", &mut |_, t| n += t.numel());
        n
    }

    /// Copy matching entries from `state` into this module.
    ///
    /// With `strict`, any missing, unexpected or mis-shaped key is an error and
    /// nothing is modified.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> TensorResult<LoadReport> {
        let mut report = LoadReport::default();
        let mut seen = Vec::new();
        self.visit("", &mut |name, t| {
            match state.get(&name) {
                Some(src) if src.shape() == t.shape() => report.loaded.push(name.clone()),
                Some(_) => report.mismatched.push(name.clone()),
                None => report.missing.push(name.clone()),
            }
            seen.push(name);
        });
        report.unexpected = state
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();

        if strict && !report.is_exact() {
            return Err(TensorError::InvalidOperation(format!(
                "state dict mismatch: missing {:?}, unexpected {:?}, mismatched {:?}",
                report.missing, report.unexpected, report.mismatched
            )));
        }

        let loaded = &report.loaded;
        self.visit_mut("", &mut |name, t| {
            if loaded.contains(&name) {
                if let Some(src) = state.get(&name) {
                    *t = src.clone();
                }
            }
        });
        Ok(report)
    }

    /// Serialize the state dict to a binary checkpoint with bincode.
    fn save<P: AsRef<Path>>(&self, path: P) -> TensorResult<()>
    where
        Self: Sized,
    {
        save_state_dict(&self.state_dict(), path)
    }

    /// Load a checkpoint written by [`Module::save`], tolerating name mismatches.
    fn load<P: AsRef<Path>>(&mut self, path: P) -> TensorResult<LoadReport>
    where
        Self: Sized,
    {
        let state = load_state_dict(path)?;
        self.load_state_dict(&state, false)
    }
}

pub fn save_state_dict<P: AsRef<Path>>(state: &StateDict, path: P) -> TensorResult<()> {
    debug!("saving {} tensors to {}", state.len(), path.as_ref().display());
    let file = File::create(path)
        .map_err(|e| TensorError::InvalidOperation(format!("Save error: {}", e)))?;
    bincode::serialize_into(BufWriter::new(file), state)
        .map_err(|e| TensorError::InvalidOperation(format!("Bincode error: {}", e)))
}

pub fn load_state_dict<P: AsRef<Path>>(path: P) -> TensorResult<StateDict> {
    debug!("reading checkpoint {}", path.as_ref().display());
    let file = File::open(path)
        .map_err(|e| TensorError::InvalidOperation(format!("Load error: {}", e)))?;
    bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| TensorError::InvalidOperation(format!("Bincode parse error: {}", e)))
}

/// Modules chained in order, named `0`, `1`, ... like their positions.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the chain.
    pub fn add(mut self, layer: Box<dyn Module>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit(&join(prefix, &i.to_string()), f);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_mut(&join(prefix, &i.to_string()), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        for layer in self.layers.iter_mut() {
            layer.for_each_norm(f);
        }
    }
}

/// Element-wise `max(x, 0)` as a layer.
pub struct ReLU;

impl Module for ReLU {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        Ok(input.relu())
    }

    fn visit(&self, _prefix: &str, _f: &mut dyn FnMut(String, &Tensor<f32>)) {}

    fn visit_mut(&mut self, _prefix: &str, _f: &mut dyn FnMut(String, &mut Tensor<f32>)) {}
}
