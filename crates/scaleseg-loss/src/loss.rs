use scaleseg_core::{Tensor, TensorError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("invalid loss config: {0}")]
    InvalidConfig(String),

    #[error("label {label} at pixel {pixel} is out of range for {num_classes} classes")]
    LabelOutOfRange {
        label: u8,
        pixel: usize,
        num_classes: usize,
    },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type LossResult<T> = Result<T, LossError>;

/// How pixels without a label take part in the PUS loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PusType {
    /// Unlabeled pixels are ignored.
    #[default]
    None,
    /// Unlabeled pixels count only when the prediction is confident enough.
    Clamp,
    /// Unlabeled pixels are weighted by their confidence.
    Soft,
}

/// `loss_decode` section of a head config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LossConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub use_sigmoid: bool,
    pub loss_weight: f32,
    /// Per-class factor on each labeled pixel's term. The mean's divisor
    /// still counts every pixel once, whatever its class weight.
    pub class_weight: Option<Vec<f32>>,
    pub ignore_index: u8,
    /// Average over labeled pixels only instead of every pixel.
    pub avg_non_ignore: bool,
    pub pus_type: PusType,
    pub pus_beta: f32,
    pub pus_k: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            kind: "CrossEntropyLoss".to_string(),
            use_sigmoid: false,
            loss_weight: 1.0,
            class_weight: None,
            ignore_index: 255,
            avg_non_ignore: false,
            pus_type: PusType::None,
            pus_beta: 0.5,
            pus_k: 1.0,
        }
    }
}

impl LossConfig {
    pub fn validate(&self) -> LossResult<()> {
        if self.kind != "CrossEntropyLoss" {
            return Err(LossError::InvalidConfig(format!("unsupported loss type `{}`", self.kind)));
        }
        if self.use_sigmoid {
            return Err(LossError::InvalidConfig("use_sigmoid is not supported".into()));
        }
        if !(self.pus_beta > 0.0 && self.pus_beta <= 1.0) {
            return Err(LossError::InvalidConfig(format!(
                "pus_beta must be in (0, 1], got {}",
                self.pus_beta
            )));
        }
        if self.pus_k <= 0.0 {
            return Err(LossError::InvalidConfig(format!("pus_k must be positive, got {}", self.pus_k)));
        }
        Ok(())
    }
}

/// Per-pixel view of `[N, C, H, W]` logits: the log-softmax over `C` for
/// every pixel, in `N, H, W` order, alongside its label.
fn pixel_log_probs<'a>(
    logits: &'a Tensor<f32>,
    labels: &'a Tensor<u8>,
) -> LossResult<(usize, impl Iterator<Item = (Vec<f32>, u8)> + 'a)> {
    let (batch, classes, h, w) = logits.shape().nchw()?;
    if labels.shape_vec() != vec![batch, h, w] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![batch, h, w],
            got: labels.shape_vec(),
        }
        .into());
    }
    let plane = h * w;
    let x = logits.data();
    let iter = (0..batch * plane).map(move |pixel| {
        let (b, p) = (pixel / plane, pixel % plane);
        let base = b * classes * plane + p;
        let row: Vec<f32> = (0..classes).map(|c| x[base + c * plane]).collect();
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let lse = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        (row.into_iter().map(|v| v - lse).collect(), labels.data()[pixel])
    });
    Ok((classes, iter))
}

fn check_label(label: u8, pixel: usize, num_classes: usize) -> LossResult<usize> {
    let idx = label as usize;
    if idx >= num_classes {
        return Err(LossError::LabelOutOfRange {
            label,
            pixel,
            num_classes,
        });
    }
    Ok(idx)
}

/// Softmax cross-entropy averaged over every pixel; pixels labeled
/// `ignore_index` contribute zero. Class weights scale the summed terms but
/// not the pixel count.
pub fn cross_entropy(
    logits: &Tensor<f32>,
    labels: &Tensor<u8>,
    class_weight: Option<&[f32]>,
    ignore_index: u8,
) -> LossResult<f32> {
    let (classes, pixels) = pixel_log_probs(logits, labels)?;
    let mut total = 0.0f64;
    let mut count = 0usize;
    for (pixel, (log_p, label)) in pixels.enumerate() {
        count += 1;
        if label == ignore_index {
            continue;
        }
        let idx = check_label(label, pixel, classes)?;
        let w = class_weight.and_then(|cw| cw.get(idx).copied()).unwrap_or(1.0);
        total -= (w * log_p[idx]) as f64;
    }
    Ok(if count == 0 { 0.0 } else { (total / count as f64) as f32 })
}

/// Cross-entropy with optional partial-unlabeled soft supervision.
#[derive(Debug, Clone)]
pub struct PusLoss {
    config: LossConfig,
}

impl PusLoss {
    pub fn new(config: LossConfig) -> LossResult<Self> {
        config.validate()?;
        Ok(PusLoss { config })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Weighted loss for `[N, C, H, W]` logits against `[N, H, W]` labels.
    ///
    /// The divisor is the number of labeled pixels plus the confidence
    /// weights of the unlabeled pixels that take part. A labeled pixel counts
    /// as 1 even under `class_weight`, the same reduction `cross_entropy` uses.
    pub fn forward(&self, logits: &Tensor<f32>, labels: &Tensor<u8>) -> LossResult<f32> {
        let cfg = &self.config;
        if cfg.pus_type == PusType::None && !cfg.avg_non_ignore {
            let ce = cross_entropy(logits, labels, cfg.class_weight.as_deref(), cfg.ignore_index)?;
            return Ok(cfg.loss_weight * ce);
        }

        let (classes, pixels) = pixel_log_probs(logits, labels)?;
        let mut numerator = 0.0f64;
        let mut denominator = 0.0f64;
        for (pixel, (log_p, label)) in pixels.enumerate() {
            if label != cfg.ignore_index {
                let idx = check_label(label, pixel, classes)?;
                let w = cfg
                    .class_weight
                    .as_ref()
                    .and_then(|cw| cw.get(idx).copied())
                    .unwrap_or(1.0);
                numerator -= (w * log_p[idx]) as f64;
                denominator += 1.0;
                continue;
            }

            let max_p = log_p.iter().cloned().fold(f32::NEG_INFINITY, f32::max).exp();
            let weight = match cfg.pus_type {
                PusType::None => 0.0,
                PusType::Clamp if max_p >= cfg.pus_beta => 1.0,
                PusType::Clamp => 0.0,
                PusType::Soft => (max_p / cfg.pus_beta).min(1.0),
            };
            if weight == 0.0 {
                continue;
            }
            numerator += (weight * soft_target_ce(&log_p, cfg.pus_k)) as f64;
            denominator += weight as f64;
        }

        let loss = if denominator > 0.0 { numerator / denominator } else { 0.0 };
        Ok(cfg.loss_weight * loss as f32)
    }
}

/// `-sum_c q_c log p_c` with the sharpened target `q ∝ p^(1/k)`.
fn soft_target_ce(log_p: &[f32], k: f32) -> f32 {
    let scaled: Vec<f32> = log_p.iter().map(|&l| l / k).collect();
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let norm: f32 = scaled.iter().map(|&s| (s - max).exp()).sum();
    scaled
        .iter()
        .zip(log_p)
        .map(|(&s, &l)| -((s - max).exp() / norm) * l)
        .sum()
}

/// Percentage of labeled pixels whose argmax matches the label.
pub fn accuracy(logits: &Tensor<f32>, labels: &Tensor<u8>, ignore_index: u8) -> LossResult<f32> {
    let (_, pixels) = pixel_log_probs(logits, labels)?;
    let (mut correct, mut total) = (0usize, 0usize);
    for (log_p, label) in pixels {
        if label == ignore_index {
            continue;
        }
        total += 1;
        let pred = log_p
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
        if pred == label as usize {
            correct += 1;
        }
    }
    Ok(if total == 0 { 0.0 } else { 100.0 * correct as f32 / total as f32 })
}
