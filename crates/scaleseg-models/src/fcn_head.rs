use rand::rngs::StdRng;
use rand::SeedableRng;
use scaleseg_core::{Tensor, TensorError, TensorResult};
use scaleseg_loss::{accuracy, LossConfig, PusLoss};
use scaleseg_nn::{interpolate, join, BatchNorm2D, Conv2D, Conv2DConfig, ConvBN, Interpolation, Module};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FcnHeadConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub in_channels: usize,
    pub channels: usize,
    pub num_classes: usize,
    pub num_convs: usize,
    pub kernel_size: usize,
    pub dilation: usize,
    /// Which backbone output to read; negative counts from the end.
    pub in_index: isize,
    pub concat_input: bool,
    /// Only meaningful for training with dropout, which this engine does not run.
    pub dropout_ratio: f32,
    pub align_corners: bool,
    /// Accepted for config compatibility; heads always use batch-norm.
    pub norm_cfg: Option<Value>,
    pub loss_decode: LossConfig,
    pub seed: u64,
}

impl Default for FcnHeadConfig {
    fn default() -> Self {
        FcnHeadConfig {
            kind: "FCNHead".to_string(),
            in_channels: 0,
            channels: 0,
            num_classes: 0,
            num_convs: 2,
            kernel_size: 3,
            dilation: 1,
            in_index: -1,
            concat_input: true,
            dropout_ratio: 0.1,
            align_corners: false,
            norm_cfg: None,
            loss_decode: LossConfig::default(),
            seed: 0,
        }
    }
}

impl FcnHeadConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.kind != "FCNHead" {
            return Err(ModelError::InvalidConfig(format!("unsupported head type `{}`", self.kind)));
        }
        if self.in_channels == 0 || self.channels == 0 || self.num_classes == 0 {
            return Err(ModelError::InvalidConfig(
                "head needs positive in_channels, channels and num_classes".into(),
            ));
        }
        if self.num_classes > 255 {
            return Err(ModelError::InvalidConfig(format!(
                "{} classes do not fit u8 label maps",
                self.num_classes
            )));
        }
        if self.kernel_size % 2 == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if self.num_convs == 0 && self.in_channels != self.channels {
            return Err(ModelError::InvalidConfig(
                "num_convs = 0 needs in_channels == channels".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_ratio) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout_ratio must be in [0, 1), got {}",
                self.dropout_ratio
            )));
        }
        if self.align_corners {
            return Err(ModelError::InvalidConfig("align_corners = true is not supported".into()));
        }
        Ok(())
    }
}

/// Fully convolutional decode head: a stack of conv-bn-relu layers, an
/// optional fusion with the input, and a 1×1 classifier.
///
/// Parameter names: `convs.{i}.{conv,bn}`, `conv_cat.{conv,bn}`, `conv_seg`.
pub struct FcnHead {
    in_index: isize,
    num_classes: usize,
    convs: Vec<ConvBN>,
    conv_cat: Option<ConvBN>,
    conv_seg: Conv2D,
    loss: PusLoss,
}

impl FcnHead {
    pub fn new(config: &FcnHeadConfig) -> ModelResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let k = config.kernel_size;
        let geometry = Conv2DConfig {
            stride: 1,
            padding: k / 2 * config.dilation,
            dilation: config.dilation,
        };

        let convs = (0..config.num_convs)
            .map(|i| {
                let in_ch = if i == 0 { config.in_channels } else { config.channels };
                ConvBN::new(Conv2D::new(in_ch, config.channels, (k, k), geometry, false, &mut rng), true)
            })
            .collect();

        let conv_cat = config.concat_input.then(|| {
            let cat = Conv2DConfig {
                stride: 1,
                padding: k / 2,
                dilation: 1,
            };
            ConvBN::new(
                Conv2D::new(config.in_channels + config.channels, config.channels, (k, k), cat, false, &mut rng),
                true,
            )
        });

        let mut conv_seg = Conv2D::new(
            config.channels,
            config.num_classes,
            (1, 1),
            Conv2DConfig::default(),
            true,
            &mut rng,
        );
        conv_seg.weight = Tensor::randn_with(conv_seg.weight.shape_vec(), 0.0, 0.01, &mut rng);

        Ok(FcnHead {
            in_index: config.in_index,
            num_classes: config.num_classes,
            convs,
            conv_cat,
            conv_seg,
            loss: PusLoss::new(config.loss_decode.clone())?,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn loss_config(&self) -> &LossConfig {
        self.loss.config()
    }

    fn select<'a>(&self, inputs: &'a [Tensor<f32>]) -> TensorResult<&'a Tensor<f32>> {
        let n = inputs.len() as isize;
        let idx = if self.in_index < 0 { n + self.in_index } else { self.in_index };
        if idx < 0 || idx >= n {
            return Err(TensorError::IndexOutOfBounds {
                index: self.in_index.unsigned_abs(),
                axis: 0,
                size: inputs.len(),
            });
        }
        Ok(&inputs[idx as usize])
    }

    /// Per-class logits at the resolution of the selected feature map.
    pub fn forward_inputs(&mut self, inputs: &[Tensor<f32>]) -> TensorResult<Tensor<f32>> {
        let x = self.select(inputs)?.clone();
        self.forward(&x)
    }

    /// Loss and pixel accuracy of `seg_logits` against `[N, H, W]` labels.
    /// Logits are resized bilinearly to the label size first.
    pub fn losses(&self, seg_logits: &Tensor<f32>, gt: &Tensor<u8>) -> ModelResult<(f32, f32)> {
        let (h, w) = match *gt.shape().dims() {
            [_, h, w] => (h, w),
            _ => {
                return Err(TensorError::RankMismatch {
                    expected: 3,
                    got: gt.shape_vec(),
                }
                .into())
            }
        };
        let logits = interpolate(seg_logits, (h, w), Interpolation::Bilinear)?;
        let loss = self.loss.forward(&logits, gt)?;
        let acc = accuracy(&logits, gt, self.loss.config().ignore_index)?;
        Ok((loss, acc))
    }
}

impl Module for FcnHead {
    fn forward(&mut self, x: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut out = x.clone();
        for conv in self.convs.iter_mut() {
            out = conv.forward(&out)?;
        }
        if let Some(cat) = &mut self.conv_cat {
            out = cat.forward(&Tensor::concatenate(&[x, &out], 1)?)?;
        }
        self.conv_seg.forward_tensor(&out)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        for (i, conv) in self.convs.iter().enumerate() {
            conv.visit(&join(prefix, &format!("convs.{}", i)), f);
        }
        if let Some(cat) = &self.conv_cat {
            cat.visit(&join(prefix, "conv_cat"), f);
        }
        self.conv_seg.visit(&join(prefix, "conv_seg"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        for (i, conv) in self.convs.iter_mut().enumerate() {
            conv.visit_mut(&join(prefix, &format!("convs.{}", i)), f);
        }
        if let Some(cat) = &mut self.conv_cat {
            cat.visit_mut(&join(prefix, "conv_cat"), f);
        }
        self.conv_seg.visit_mut(&join(prefix, "conv_seg"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.for_each_norm(&mut |bn| bn.set_training(training));
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        for conv in self.convs.iter_mut() {
            conv.for_each_norm(f);
        }
        if let Some(cat) = &mut self.conv_cat {
            cat.for_each_norm(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FcnHeadConfig {
        FcnHeadConfig {
            in_channels: 8,
            channels: 4,
            num_classes: 3,
            ..FcnHeadConfig::default()
        }
    }

    fn features() -> Vec<Tensor<f32>> {
        vec![
            Tensor::randn(vec![2, 4, 8, 8], Some(1)),
            Tensor::randn(vec![2, 8, 4, 4], Some(2)),
        ]
    }

    #[test]
    fn test_logits_shape_and_names() {
        let mut head = FcnHead::new(&config()).unwrap();
        let logits = head.forward_inputs(&features()).unwrap();
        assert_eq!(logits.shape_vec(), vec![2, 3, 4, 4]);

        let names: Vec<String> = head.state_dict().keys().cloned().collect();
        assert!(names.contains(&"convs.1.bn.running_mean".to_string()));
        assert!(names.contains(&"conv_cat.conv.weight".to_string()));
        assert!(names.contains(&"conv_seg.bias".to_string()));
        assert_eq!(head.state_dict()["conv_cat.conv.weight"].shape_vec(), vec![4, 12, 3, 3]);
    }

    #[test]
    fn test_in_index_and_no_concat() {
        let cfg = FcnHeadConfig {
            in_channels: 4,
            in_index: 0,
            num_convs: 1,
            concat_input: false,
            ..config()
        };
        let mut head = FcnHead::new(&cfg).unwrap();
        assert_eq!(head.forward_inputs(&features()).unwrap().shape_vec(), vec![2, 3, 8, 8]);
        assert!(!head.state_dict().keys().any(|k| k.starts_with("conv_cat")));

        let far = FcnHeadConfig { in_index: 5, ..cfg };
        let mut head = FcnHead::new(&far).unwrap();
        assert!(head.forward_inputs(&features()).is_err());
    }

    #[test]
    fn test_losses_resize_to_labels() {
        let mut head = FcnHead::new(&config()).unwrap();
        let logits = head.forward_inputs(&features()).unwrap();
        let gt = Tensor::new((0..2 * 16 * 16).map(|i| (i % 3) as u8).collect(), vec![2, 16, 16]).unwrap();
        let (loss, acc) = head.losses(&logits, &gt).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!((0.0..=100.0).contains(&acc));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(FcnHead::new(&FcnHeadConfig { kernel_size: 2, ..config() }).is_err());
        assert!(FcnHead::new(&FcnHeadConfig { num_convs: 0, ..config() }).is_err());
        assert!(FcnHead::new(&FcnHeadConfig { num_classes: 0, ..config() }).is_err());
        let pus = FcnHeadConfig {
            loss_decode: LossConfig {
                pus_k: 0.0,
                ..LossConfig::default()
            },
            ..config()
        };
        assert!(matches!(FcnHead::new(&pus), Err(ModelError::Loss(_))));
    }
}
