use std::path::PathBuf;

use log::info;
use scaleseg_config::{params, Registry};
use serde::Deserialize;
use serde_json::Value;

use crate::backbone::Backbone;
use crate::error::{ModelError, ModelResult};
use crate::fcn_head::{FcnHead, FcnHeadConfig};
use crate::scalenet::{ScaleNet, ScaleNetConfig};
use crate::segmentor::EncoderDecoder;

pub type BackboneRegistry = Registry<Box<dyn Backbone>, ModelError>;
pub type SegmentorRegistry = Registry<EncoderDecoder, ModelError>;

/// Registry of every backbone type known to this crate.
pub fn backbones() -> ModelResult<BackboneRegistry> {
    let mut reg = BackboneRegistry::new("backbone");
    reg.register("ScaleNet", |cfg| {
        let config: ScaleNetConfig = params(cfg)?;
        Ok(Box::new(ScaleNet::new(&config)?) as Box<dyn Backbone>)
    })?;
    Ok(reg)
}

/// Registry of every segmentor type known to this crate.
pub fn segmentors() -> ModelResult<SegmentorRegistry> {
    let mut reg = SegmentorRegistry::new("segmentor");
    reg.register("EncoderDecoder", build_encoder_decoder)?;
    Ok(reg)
}

/// `model` section of an experiment config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EncoderDecoderConfig {
    #[serde(default)]
    pretrained: Option<PathBuf>,
    backbone: Value,
    decode_head: FcnHeadConfig,
    #[serde(default)]
    auxiliary_head: Option<FcnHeadConfig>,
    #[serde(default, rename = "train_cfg")]
    _train_cfg: Value,
    #[serde(default, rename = "test_cfg")]
    _test_cfg: Value,
}

fn build_encoder_decoder(cfg: &Value) -> ModelResult<EncoderDecoder> {
    let config: EncoderDecoderConfig = params(cfg)?;
    let mut backbone = backbones()?.build(&config.backbone)?;
    if let Some(path) = &config.pretrained {
        info!("initializing backbone from {}", path.display());
        backbone.init_weights(Some(path.as_path()))?;
    }
    let decode_head = FcnHead::new(&config.decode_head)?;
    let auxiliary_head = config.auxiliary_head.as_ref().map(FcnHead::new).transpose()?;
    Ok(EncoderDecoder::new(backbone, decode_head, auxiliary_head))
}

pub fn build_backbone(cfg: &Value) -> ModelResult<Box<dyn Backbone>> {
    backbones()?.build(cfg)
}

/// Build the segmentor described by a config's `model` section.
pub fn build_segmentor(cfg: &Value) -> ModelResult<EncoderDecoder> {
    segmentors()?.build(cfg)
}
