use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use scaleseg_core::{Tensor, TensorError, TensorResult};
use scaleseg_nn::{join, BatchNorm2D, Conv2D, Conv2DConfig, LoadReport, MaxPool2D, Module};
use serde::{Deserialize, Serialize};

use crate::backbone::{load_checkpoint, Backbone};
use crate::error::{ModelError, ModelResult};
use crate::sablock::{SABlock, EXPANSION};
use crate::structure::{StructureCursor, StructureDescriptor};

const NUM_STAGES: usize = 4;

/// Where the block structure comes from: a JSON file or inline entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StructureSource {
    Path(PathBuf),
    Inline(Vec<Vec<usize>>),
}

impl StructureSource {
    pub fn load(&self) -> ModelResult<StructureDescriptor> {
        match self {
            StructureSource::Path(p) if p.as_os_str().is_empty() => {
                Err(ModelError::InvalidConfig("`structure` is required".into()))
            }
            StructureSource::Path(p) => StructureDescriptor::from_file(p),
            StructureSource::Inline(entries) => StructureDescriptor::from_entries(entries),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleNetConfig {
    /// Blocks per stage.
    pub layers: Vec<usize>,
    pub structure: StructureSource,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    /// Stages whose outputs are returned.
    pub out_indices: Vec<usize>,
    /// Keep batch-norm layers in eval mode while training.
    pub norm_eval: bool,
    pub base_channels: usize,
    pub in_channels: usize,
    pub pretrained: Option<PathBuf>,
    pub seed: u64,
}

impl Default for ScaleNetConfig {
    fn default() -> Self {
        ScaleNetConfig {
            layers: vec![3, 4, 6, 3],
            structure: StructureSource::Path(PathBuf::new()),
            strides: vec![1, 2, 2, 2],
            dilations: vec![1, 1, 2, 4],
            out_indices: vec![0, 1, 2, 3],
            norm_eval: false,
            base_channels: 64,
            in_channels: 3,
            pretrained: None,
            seed: 0,
        }
    }
}

impl ScaleNetConfig {
    pub fn validate(&self) -> ModelResult<()> {
        for (name, values) in [("layers", &self.layers), ("strides", &self.strides), ("dilations", &self.dilations)] {
            if values.len() != NUM_STAGES {
                return Err(ModelError::InvalidConfig(format!(
                    "`{}` needs {} values, got {}",
                    name,
                    NUM_STAGES,
                    values.len()
                )));
            }
            if values.contains(&0) {
                return Err(ModelError::InvalidConfig(format!("`{}` values must be positive", name)));
            }
        }
        if self.out_indices.is_empty() {
            return Err(ModelError::InvalidConfig("`out_indices` is empty".into()));
        }
        if let Some(&bad) = self.out_indices.iter().find(|&&i| i >= NUM_STAGES) {
            return Err(ModelError::InvalidConfig(format!(
                "out index {} is out of range 0..{}",
                bad, NUM_STAGES
            )));
        }
        if self.base_channels == 0 || self.in_channels == 0 {
            return Err(ModelError::InvalidConfig("channel counts must be positive".into()));
        }
        Ok(())
    }
}

/// Residual backbone of four stages of [`SABlock`]s whose branch widths come
/// from a structure descriptor.
///
/// Parameter names follow `conv1`, `bn1`, `layer{1..4}.{block}.*`.
pub struct ScaleNet {
    conv1: Conv2D,
    bn1: BatchNorm2D,
    stages: Vec<Vec<SABlock>>,
    out_indices: Vec<usize>,
    norm_eval: bool,
    training: bool,
}

impl ScaleNet {
    pub fn new(config: &ScaleNetConfig) -> ModelResult<Self> {
        config.validate()?;
        let descriptor = config.structure.load()?;
        let needed: usize = config.layers.iter().sum();
        if descriptor.len() < needed {
            return Err(ModelError::Structure(format!(
                "descriptor has {} entries, {} blocks need one each",
                descriptor.len(),
                needed
            )));
        }
        if descriptor.len() > needed {
            debug!("{} trailing structure entries unused", descriptor.len() - needed);
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let base = config.base_channels;
        let stem = Conv2DConfig {
            stride: 2,
            padding: 3,
            dilation: 1,
        };
        let conv1 = Conv2D::new(config.in_channels, base, (7, 7), stem, false, &mut rng);
        let bn1 = BatchNorm2D::new(base);

        let mut cursor = descriptor.cursor();
        let mut inplanes = base;
        let mut stages = Vec::with_capacity(NUM_STAGES);
        for stage in 0..NUM_STAGES {
            let planes = base << stage;
            let blocks = make_stage(
                &mut inplanes,
                planes,
                config.layers[stage],
                config.strides[stage],
                config.dilations[stage],
                &mut cursor,
                &mut rng,
            )?;
            stages.push(blocks);
        }

        let mut net = ScaleNet {
            conv1,
            bn1,
            stages,
            out_indices: config.out_indices.clone(),
            norm_eval: config.norm_eval,
            training: true,
        };
        info!(
            "built ScaleNet with layers {:?} and {} parameters",
            config.layers,
            net.num_parameters()
        );
        net.init_weights(config.pretrained.as_deref())?;
        Ok(net)
    }

    pub fn stages(&self) -> &[Vec<SABlock>] {
        &self.stages
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

fn make_stage(
    inplanes: &mut usize,
    planes: usize,
    blocks: usize,
    stride: usize,
    dilation: usize,
    cursor: &mut StructureCursor<'_>,
    rng: &mut StdRng,
) -> ModelResult<Vec<SABlock>> {
    let downsample = stride != 1 || *inplanes != planes * EXPANSION;
    let mut layer = Vec::with_capacity(blocks);
    layer.push(SABlock::new(
        *inplanes,
        planes,
        stride,
        downsample,
        cursor.next_block()?,
        dilation,
        rng,
    ));
    *inplanes = planes * EXPANSION;
    for _ in 1..blocks {
        layer.push(SABlock::new(*inplanes, planes, 1, false, cursor.next_block()?, dilation, rng));
    }
    Ok(layer)
}

impl Module for ScaleNet {
    /// Deepest selected feature map.
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut outs = self.forward_features(input)?;
        outs.pop().ok_or(TensorError::EmptyTensor)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        self.conv1.visit(&join(prefix, "conv1"), f);
        self.bn1.visit(&join(prefix, "bn1"), f);
        for (s, stage) in self.stages.iter().enumerate() {
            for (b, block) in stage.iter().enumerate() {
                block.visit(&join(prefix, &format!("layer{}.{}", s + 1, b)), f);
            }
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        self.conv1.visit_mut(&join(prefix, "conv1"), f);
        self.bn1.visit_mut(&join(prefix, "bn1"), f);
        for (s, stage) in self.stages.iter_mut().enumerate() {
            for (b, block) in stage.iter_mut().enumerate() {
                block.visit_mut(&join(prefix, &format!("layer{}.{}", s + 1, b)), f);
            }
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.for_each_norm(&mut |bn| bn.set_training(training));
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        f(&mut self.bn1);
        for block in self.stages.iter_mut().flatten() {
            block.for_each_norm(f);
        }
    }
}

impl Backbone for ScaleNet {
    fn forward_features(&mut self, input: &Tensor<f32>) -> TensorResult<Vec<Tensor<f32>>> {
        let mut x = self.bn1.forward(&self.conv1.forward_tensor(input)?)?;
        x.relu_mut();
        x = MaxPool2D::with_stride(3, 2, 1).forward_tensor(&x)?;

        let mut stage_outs = Vec::with_capacity(NUM_STAGES);
        for stage in self.stages.iter_mut() {
            for block in stage.iter_mut() {
                x = block.forward(&x)?;
            }
            stage_outs.push(x.clone());
        }
        Ok(self.out_indices.iter().map(|&i| stage_outs[i].clone()).collect())
    }

    fn out_channels(&self) -> Vec<usize> {
        self.out_indices
            .iter()
            .map(|&i| self.stages[i].last().map_or(0, SABlock::out_channels))
            .collect()
    }

    /// Training mode keeps batch-norm frozen when `norm_eval` is set.
    fn train(&mut self, mode: bool) {
        self.set_training(mode);
        if mode && self.norm_eval {
            self.for_each_norm(&mut |bn| bn.set_training(false));
        }
    }

    fn init_weights(&mut self, pretrained: Option<&Path>) -> ModelResult<Option<LoadReport>> {
        match pretrained {
            Some(path) => Ok(Some(load_checkpoint(self, path)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaleseg_nn::save_state_dict;

    fn tiny_config() -> ScaleNetConfig {
        ScaleNetConfig {
            layers: vec![1, 1, 1, 1],
            structure: StructureSource::Inline(vec![
                vec![2, 1, 1, 0, 16],
                vec![2, 2, 2, 2, 8],
                vec![4, 2, 0, 2, 4],
                vec![8, 0, 0, 0, 2],
            ]),
            base_channels: 4,
            seed: 11,
            ..ScaleNetConfig::default()
        }
    }

    fn image() -> Tensor<f32> {
        Tensor::randn(vec![2, 3, 64, 64], Some(5))
    }

    #[test]
    fn test_pyramid_shapes() {
        let mut net = ScaleNet::new(&tiny_config()).unwrap();
        let outs = net.forward_features(&image()).unwrap();
        let shapes: Vec<_> = outs.iter().map(|o| o.shape_vec()).collect();
        assert_eq!(
            shapes,
            vec![vec![2, 16, 16, 16], vec![2, 32, 8, 8], vec![2, 64, 4, 4], vec![2, 128, 2, 2]]
        );
        assert_eq!(net.out_channels(), vec![16, 32, 64, 128]);
    }

    #[test]
    fn test_out_indices_select_stages() {
        let cfg = ScaleNetConfig {
            out_indices: vec![1, 3],
            ..tiny_config()
        };
        let mut net = ScaleNet::new(&cfg).unwrap();
        let outs = net.forward_features(&image()).unwrap();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].shape_vec()[1], 32);
        assert_eq!(net.forward(&image()).unwrap().shape_vec(), vec![2, 128, 2, 2]);
    }

    #[test]
    fn test_parameter_names() {
        let net = ScaleNet::new(&tiny_config()).unwrap();
        let state = net.state_dict();
        for key in [
            "conv1.weight",
            "bn1.running_var",
            "layer1.0.downsample.0.weight",
            "layer1.0.conv2.2.weight",
            "layer2.0.bn2.3.bias",
            "layer4.0.conv3.weight",
        ] {
            assert!(state.contains_key(key), "missing {}", key);
        }
        assert!(!state.contains_key("layer1.0.conv2.3.weight"));
        assert!(!state.contains_key("conv1.bias"));
    }

    #[test]
    fn test_norm_eval_freezes_running_stats() {
        let cfg = ScaleNetConfig {
            norm_eval: true,
            ..tiny_config()
        };
        let mut net = ScaleNet::new(&cfg).unwrap();
        net.train(true);
        assert!(net.is_training());
        let before = net.state_dict()["bn1.running_mean"].clone();
        net.forward_features(&image()).unwrap();
        assert_eq!(net.state_dict()["bn1.running_mean"], before);

        let mut plain = ScaleNet::new(&tiny_config()).unwrap();
        plain.train(true);
        plain.forward_features(&image()).unwrap();
        assert_ne!(plain.state_dict()["bn1.running_mean"], before);
    }

    #[test]
    fn test_init_weights_from_checkpoint() {
        let src = ScaleNet::new(&tiny_config()).unwrap();
        let path = std::env::temp_dir().join("scaleseg_scalenet_ckpt.bin");
        let mut state = src.state_dict();
        let w = state.remove("conv1.weight").unwrap();
        state.insert("module.conv1.weight".into(), w);
        state.insert("fc.weight".into(), Tensor::zeros(vec![10]));
        save_state_dict(&state, &path).unwrap();

        let mut dst = ScaleNet::new(&ScaleNetConfig { seed: 99, ..tiny_config() }).unwrap();
        assert_ne!(dst.state_dict()["conv1.weight"], src.state_dict()["conv1.weight"]);
        let report = dst.init_weights(Some(path.as_path())).unwrap().unwrap();
        assert_eq!(report.unexpected, vec!["fc.weight".to_string()]);
        assert!(report.missing.is_empty());
        assert_eq!(dst.state_dict()["conv1.weight"], src.state_dict()["conv1.weight"]);
        assert!(dst.init_weights(None).unwrap().is_none());
    }

    #[test]
    fn test_config_errors() {
        let short = ScaleNetConfig {
            layers: vec![2, 1, 1, 1],
            ..tiny_config()
        };
        assert!(matches!(ScaleNet::new(&short), Err(ModelError::Structure(_))));
        let bad_index = ScaleNetConfig {
            out_indices: vec![4],
            ..tiny_config()
        };
        assert!(matches!(ScaleNet::new(&bad_index), Err(ModelError::InvalidConfig(_))));
        assert!(matches!(
            ScaleNet::new(&ScaleNetConfig::default()),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let cfg: ScaleNetConfig = serde_json::from_str(
            r#"{"layers": [3, 4, 23, 3], "structure": "structures/scalenet101.json", "norm_eval": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.structure, StructureSource::Path("structures/scalenet101.json".into()));
        assert_eq!(cfg.dilations, vec![1, 1, 2, 4]);
        assert!(serde_json::from_str::<ScaleNetConfig>(r#"{"pretrained": 3}"#).is_err());
    }
}
