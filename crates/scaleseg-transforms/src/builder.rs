use log::debug;
use scaleseg_config::Registry;
use serde_json::Value;

use crate::augmentation::RandomFlip;
use crate::error::{TransformError, TransformResult};
use crate::geometric::{Pad, RandomCrop, RandomRotate, Resize, SegRescale};
use crate::io::{LoadAnnotations, LoadImageFromFile};
use crate::photometric::{Normalize, Rgb2Gray};
use crate::transform::{Compose, Transform};

pub type PipelineRegistry = Registry<Box<dyn Transform>, TransformError>;

fn boxed<T: Transform + 'static>(t: TransformResult<T>) -> TransformResult<Box<dyn Transform>> {
    Ok(Box::new(t?))
}

/// Registry of every pipeline step, keyed by its config `type`.
pub fn pipelines() -> TransformResult<PipelineRegistry> {
    let mut reg = PipelineRegistry::new("pipeline");
    reg.register("LoadImageFromFile", |cfg| boxed(LoadImageFromFile::from_config(cfg)))?;
    reg.register("LoadAnnotations", |cfg| boxed(LoadAnnotations::from_config(cfg)))?;
    reg.register("Resize", |cfg| boxed(Resize::from_config(cfg)))?;
    reg.register("RandomFlip", |cfg| boxed(RandomFlip::from_config(cfg)))?;
    reg.register("RandomCrop", |cfg| boxed(RandomCrop::from_config(cfg)))?;
    reg.register("Pad", |cfg| boxed(Pad::from_config(cfg)))?;
    reg.register("RandomRotate", |cfg| boxed(RandomRotate::from_config(cfg)))?;
    reg.register("Normalize", |cfg| boxed(Normalize::from_config(cfg)))?;
    reg.register("RGB2Gray", |cfg| boxed(Rgb2Gray::from_config(cfg)))?;
    reg.register("SegRescale", |cfg| boxed(SegRescale::from_config(cfg)))?;
    Ok(reg)
}

/// Build a [`Compose`] from a JSON list such as a config's `train_pipeline`.
pub fn build_pipeline(cfgs: &Value) -> TransformResult<Compose> {
    let steps = pipelines()?.build_all(cfgs)?;
    let pipeline = Compose::new(steps);
    debug!("built pipeline {}", pipeline);
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{SegResults, GT_SEMANTIC_SEG};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use scaleseg_config::ConfigError;
    use scaleseg_core::Tensor;
    use serde_json::json;

    #[test]
    fn test_every_step_is_registered() {
        let reg = pipelines().unwrap();
        assert_eq!(reg.names().count(), 10);
        assert!(reg.contains("RGB2Gray"));
        assert!(reg.contains("SegRescale"));
    }

    #[test]
    fn test_train_pipeline_runs() {
        let cfg = json!([
            {"type": "Resize", "img_scale": [64, 32], "ratio_range": [0.5, 2.0]},
            {"type": "RandomCrop", "crop_size": [16, 16], "cat_max_ratio": 0.75},
            {"type": "RandomFlip", "prob": 0.5},
            {"type": "Normalize", "mean": [123.675, 116.28, 103.53], "std": [58.395, 57.12, 57.375], "to_rgb": true},
            {"type": "Pad", "size": [16, 16], "pad_val": 0, "seg_pad_val": 255}
        ]);
        let pipeline = build_pipeline(&cfg).unwrap();
        assert_eq!(pipeline.len(), 5);
        assert!(pipeline.to_string().starts_with("Compose(\n    Resize("));

        let img = Tensor::full(vec![24, 40, 3], 100.0);
        let seg = Tensor::new((0..24 * 40).map(|i| (i % 3) as u8).collect(), vec![24, 40]).unwrap();
        let mut results = SegResults::from_image(img).with_seg(GT_SEMANTIC_SEG, seg);
        pipeline.apply(&mut results, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(results.img_shape, vec![16, 16, 3]);
        assert_eq!(results.gt_semantic_seg().unwrap().shape_vec(), vec![16, 16]);
        assert!(results.img_norm_cfg.is_some());
    }

    #[test]
    fn test_unknown_or_invalid_steps() {
        assert!(matches!(
            build_pipeline(&json!([{"type": "PhotoMetricDistortion"}])),
            Err(TransformError::Config(ConfigError::UnknownType { .. }))
        ));
        assert!(matches!(
            build_pipeline(&json!([{"type": "RandomCrop", "crop_size": [0, 4]}])),
            Err(TransformError::InvalidConfig { transform: "RandomCrop", .. })
        ));
        assert!(build_pipeline(&json!({"type": "Pad"})).is_err());
    }
}
