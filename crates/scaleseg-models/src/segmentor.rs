use std::collections::BTreeMap;

use log::debug;
use scaleseg_core::{Tensor, TensorResult};
use scaleseg_nn::{interpolate, join, BatchNorm2D, Interpolation, Module};

use crate::backbone::Backbone;
use crate::error::ModelResult;
use crate::fcn_head::FcnHead;

/// Named scalar outputs of a training step, e.g. `decode.loss_seg`.
pub type Losses = BTreeMap<String, f32>;

/// Sum of every entry whose name contains `loss`.
pub fn total_loss(losses: &Losses) -> f32 {
    losses
        .iter()
        .filter(|(name, _)| name.contains("loss"))
        .map(|(_, v)| v)
        .sum()
}

/// Backbone followed by a decode head and an optional auxiliary head.
///
/// Parameter names are prefixed `backbone.`, `decode_head.` and
/// `auxiliary_head.`.
pub struct EncoderDecoder {
    backbone: Box<dyn Backbone>,
    decode_head: FcnHead,
    auxiliary_head: Option<FcnHead>,
}

impl EncoderDecoder {
    pub fn new(backbone: Box<dyn Backbone>, decode_head: FcnHead, auxiliary_head: Option<FcnHead>) -> Self {
        EncoderDecoder {
            backbone,
            decode_head,
            auxiliary_head,
        }
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn backbone_mut(&mut self) -> &mut dyn Backbone {
        self.backbone.as_mut()
    }

    pub fn num_classes(&self) -> usize {
        self.decode_head.num_classes()
    }

    pub fn train(&mut self, mode: bool) {
        self.backbone.train(mode);
        self.decode_head.set_training(mode);
        if let Some(aux) = &mut self.auxiliary_head {
            aux.set_training(mode);
        }
    }

    pub fn extract_feat(&mut self, img: &Tensor<f32>) -> TensorResult<Vec<Tensor<f32>>> {
        self.backbone.forward_features(img)
    }

    /// Decode-head logits resized to the input's spatial size.
    pub fn encode_decode(&mut self, img: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (_, _, h, w) = img.shape().nchw()?;
        let feats = self.extract_feat(img)?;
        let logits = self.decode_head.forward_inputs(&feats)?;
        interpolate(&logits, (h, w), Interpolation::Bilinear)
    }

    /// Losses and accuracies of every head for `[N, C, H, W]` images and
    /// `[N, H, W]` labels.
    pub fn forward_train(&mut self, img: &Tensor<f32>, gt: &Tensor<u8>) -> ModelResult<Losses> {
        let feats = self.extract_feat(img)?;
        let mut losses = Losses::new();

        let logits = self.decode_head.forward_inputs(&feats)?;
        let (loss, acc) = self.decode_head.losses(&logits, gt)?;
        losses.insert("decode.loss_seg".into(), loss);
        losses.insert("decode.acc_seg".into(), acc);

        if let Some(aux) = &mut self.auxiliary_head {
            let logits = aux.forward_inputs(&feats)?;
            let (loss, acc) = aux.losses(&logits, gt)?;
            losses.insert("aux.loss_seg".into(), loss);
            losses.insert("aux.acc_seg".into(), acc);
        }
        debug!("train losses: {:?}", losses);
        Ok(losses)
    }

    /// Per-pixel class predictions `[N, H, W]`.
    pub fn inference(&mut self, img: &Tensor<f32>) -> TensorResult<Tensor<u8>> {
        let logits = self.encode_decode(img)?;
        Ok(logits.argmax_axis(1)?.map(|c| c as u8))
    }
}

impl Module for EncoderDecoder {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.encode_decode(input)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        self.backbone.visit(&join(prefix, "backbone"), f);
        self.decode_head.visit(&join(prefix, "decode_head"), f);
        if let Some(aux) = &self.auxiliary_head {
            aux.visit(&join(prefix, "auxiliary_head"), f);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        self.backbone.visit_mut(&join(prefix, "backbone"), f);
        self.decode_head.visit_mut(&join(prefix, "decode_head"), f);
        if let Some(aux) = &mut self.auxiliary_head {
            aux.visit_mut(&join(prefix, "auxiliary_head"), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        self.train(training);
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        self.backbone.for_each_norm(f);
        self.decode_head.for_each_norm(f);
        if let Some(aux) = &mut self.auxiliary_head {
            aux.for_each_norm(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcn_head::FcnHeadConfig;
    use crate::scalenet::{ScaleNet, ScaleNetConfig, StructureSource};
    use scaleseg_loss::{LossConfig, PusType};

    fn segmentor(aux: bool) -> EncoderDecoder {
        let backbone = ScaleNet::new(&ScaleNetConfig {
            layers: vec![1, 1, 1, 1],
            structure: StructureSource::Inline(vec![vec![2, 2, 0, 0, 8]; 4]),
            base_channels: 2,
            norm_eval: true,
            ..ScaleNetConfig::default()
        })
        .unwrap();
        let decode = FcnHead::new(&FcnHeadConfig {
            in_channels: 64,
            channels: 4,
            num_classes: 3,
            loss_decode: LossConfig {
                pus_type: PusType::Soft,
                pus_beta: 0.9,
                ..LossConfig::default()
            },
            ..FcnHeadConfig::default()
        })
        .unwrap();
        let aux = aux.then(|| {
            FcnHead::new(&FcnHeadConfig {
                in_channels: 32,
                channels: 4,
                num_classes: 3,
                num_convs: 1,
                concat_input: false,
                in_index: 2,
                loss_decode: LossConfig {
                    loss_weight: 0.4,
                    ..LossConfig::default()
                },
                ..FcnHeadConfig::default()
            })
            .unwrap()
        });
        EncoderDecoder::new(Box::new(backbone), decode, aux)
    }

    fn batch() -> (Tensor<f32>, Tensor<u8>) {
        let img = Tensor::randn(vec![2, 3, 32, 32], Some(4));
        let gt = Tensor::new(
            (0..2 * 32 * 32).map(|i| if i % 5 == 0 { 255 } else { (i % 3) as u8 }).collect(),
            vec![2, 32, 32],
        )
        .unwrap();
        (img, gt)
    }

    #[test]
    fn test_inference_matches_input_size() {
        let mut model = segmentor(false);
        model.train(false);
        let (img, _) = batch();
        let pred = model.inference(&img).unwrap();
        assert_eq!(pred.shape_vec(), vec![2, 32, 32]);
        assert!(pred.data().iter().all(|&c| c < 3));
    }

    #[test]
    fn test_forward_train_reports_every_head() {
        let mut model = segmentor(true);
        model.train(true);
        let (img, gt) = batch();
        let losses = model.forward_train(&img, &gt).unwrap();
        let keys: Vec<&str> = losses.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["aux.acc_seg", "aux.loss_seg", "decode.acc_seg", "decode.loss_seg"]);
        let total = total_loss(&losses);
        assert!((total - losses["aux.loss_seg"] - losses["decode.loss_seg"]).abs() < 1e-6);
        assert!(total.is_finite() && total > 0.0);
    }

    #[test]
    fn test_state_dict_prefixes() {
        let model = segmentor(true);
        let state = model.state_dict();
        assert!(state.contains_key("backbone.layer1.0.conv1.weight"));
        assert!(state.contains_key("decode_head.conv_seg.weight"));
        assert!(state.contains_key("auxiliary_head.convs.0.conv.weight"));
    }
}
