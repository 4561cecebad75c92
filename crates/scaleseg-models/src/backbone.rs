use std::path::Path;

use log::{info, warn};
use scaleseg_core::{Tensor, TensorResult};
use scaleseg_nn::{load_state_dict, LoadReport, Module, StateDict};

use crate::error::ModelResult;

/// A feature extractor producing a pyramid of feature maps.
pub trait Backbone: Module {
    /// Feature maps selected by the backbone's output indices, finest first.
    fn forward_features(&mut self, input: &Tensor<f32>) -> TensorResult<Vec<Tensor<f32>>>;

    /// Channel count of each map returned by [`Backbone::forward_features`].
    fn out_channels(&self) -> Vec<usize>;

    /// Switch training mode for the whole tree.
    fn train(&mut self, mode: bool) {
        self.set_training(mode);
    }

    /// Load pretrained weights; `None` keeps the current initialization.
    fn init_weights(&mut self, pretrained: Option<&Path>) -> ModelResult<Option<LoadReport>>;
}

/// Load a checkpoint into `module`, tolerating missing and extra keys.
///
/// A `module.` prefix left by data-parallel wrappers is stripped first.
pub fn load_checkpoint<M: Module + ?Sized>(module: &mut M, path: &Path) -> ModelResult<LoadReport> {
    let state = load_state_dict(path)?;
    let state: StateDict = state
        .into_iter()
        .map(|(k, v)| match k.strip_prefix("module.") {
            Some(rest) => (rest.to_string(), v),
            None => (k, v),
        })
        .collect();

    let report = module.load_state_dict(&state, false)?;
    info!("loaded {} tensors from {}", report.loaded.len(), path.display());
    if !report.missing.is_empty() {
        warn!("missing keys in source state_dict: {}", report.missing.join(", "));
    }
    if !report.unexpected.is_empty() {
        warn!("unexpected keys in source state_dict: {}", report.unexpected.join(", "));
    }
    if !report.mismatched.is_empty() {
        warn!("size mismatch for: {}", report.mismatched.join(", "));
    }
    Ok(report)
}
