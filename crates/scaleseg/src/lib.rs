//! # ScaleSeg
//!
//! Semantic segmentation with searched multi-scale backbones, written in
//! Rust.
//!
//! ## Modules
//!
//! - **core**: Tensor engine: `[N, C, H, W]` feature maps, `[H, W, C]` images, label maps
//! - **nn**: Layers: Conv2D, BatchNorm2D, MaxPool2D, interpolation, state dicts
//! - **config**: JSON experiment configs with `_base_` inheritance and type registries
//! - **models**: SABlock, ScaleNet, FCN head, EncoderDecoder
//! - **loss**: Cross-entropy and the partial-unlabeled soft (PUS) loss
//! - **transforms**: Augmentation pipeline: load, resize, flip, crop, pad, rotate, normalize
//! - **data**: Datasets and a parallel, seeded DataLoader
//! - **metrics**: Pixel accuracy and mean IoU

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

/// Core tensor engine.
pub use scaleseg_core as core;

/// Neural network layers.
pub use scaleseg_nn as nn;

/// Configuration files and registries.
pub use scaleseg_config as config;

/// Backbones, heads and segmentors.
pub use scaleseg_models as models;

/// Segmentation losses.
pub use scaleseg_loss as loss;

/// Augmentation pipeline.
pub use scaleseg_transforms as transforms;

/// Datasets and loaders.
pub use scaleseg_data as data;

/// Evaluation metrics.
pub use scaleseg_metrics as metrics;

/// Convenience prelude: `use scaleseg::prelude::*;`
pub mod prelude {
    pub use scaleseg_config::Config;
    pub use scaleseg_core::{Shape, Tensor, TensorError, TensorResult};
    pub use scaleseg_data::{Batch, DataLoader, Dataset};
    pub use scaleseg_metrics::{mean_iou, pixel_accuracy};
    pub use scaleseg_models::{Backbone, EncoderDecoder, ScaleNet, ScaleNetConfig};
    pub use scaleseg_nn::Module;
    pub use scaleseg_transforms::{Compose, SegResults, Transform};

    pub use crate::{init_logger, Experiment};
}

/// Install an `env_logger` reading `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Model(#[from] models::ModelError),

    #[error(transparent)]
    Transform(#[from] transforms::TransformError),

    #[error(transparent)]
    Data(#[from] data::DataError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An experiment config and the components it describes.
///
/// Expected sections: `model`, `train_pipeline` and `data.train`. A
/// `data.train` entry without its own `pipeline` uses `train_pipeline`.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub config: config::Config,
}

impl Experiment {
    pub fn new(config: config::Config) -> Self {
        Experiment { config }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = config::Config::from_file(path)?;
        log::info!("loaded experiment config {:?}", config.filename());
        Ok(Experiment { config })
    }

    fn section(&self, key: &str) -> Result<&Value> {
        Ok(self
            .config
            .get(key)
            .ok_or_else(|| config::ConfigError::MissingKey(key.to_string()))?)
    }

    pub fn build_model(&self) -> Result<models::EncoderDecoder> {
        Ok(models::build_segmentor(self.section("model")?)?)
    }

    pub fn train_pipeline(&self) -> Result<transforms::Compose> {
        Ok(transforms::build_pipeline(self.section("train_pipeline")?)?)
    }

    pub fn train_dataset(&self) -> Result<Box<dyn data::Dataset>> {
        let mut cfg = self.section("data.train")?.clone();
        if cfg.get("pipeline").is_none() {
            if let (Some(obj), Some(pipeline)) = (cfg.as_object_mut(), self.config.get("train_pipeline")) {
                obj.insert("pipeline".to_string(), pipeline.clone());
            }
        }
        Ok(data::build_dataset(&cfg)?)
    }
}
