//! Per-pixel value transforms.

use std::fmt;

use rand::rngs::StdRng;
use scaleseg_config::params;
use scaleseg_core::Tensor;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{bad_input, invalid, TransformResult};
use crate::results::{ImgNormCfg, SegResults};
use crate::transform::Transform;
use crate::warp::dims;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NormalizeParams {
    mean: Vec<f32>,
    std: Vec<f32>,
    #[serde(default = "default_true")]
    to_rgb: bool,
}

/// `(img - mean) / std` per channel, after reversing the channel order when
/// `to_rgb` is set.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
    to_rgb: bool,
}

impl Normalize {
    const NAME: &'static str = "Normalize";

    pub fn new(mean: Vec<f32>, std: Vec<f32>, to_rgb: bool) -> TransformResult<Self> {
        if mean.is_empty() || mean.len() != std.len() {
            return Err(invalid(
                Self::NAME,
                format!("mean has {} entries and std {}", mean.len(), std.len()),
            ));
        }
        if std.iter().any(|&s| s == 0.0) {
            return Err(invalid(Self::NAME, "std must be non-zero"));
        }
        Ok(Normalize { mean, std, to_rgb })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: NormalizeParams = params(cfg)?;
        Self::new(p.mean, p.std, p.to_rgb)
    }
}

impl Transform for Normalize {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        let (_, _, c) = dims(results.img()?)?;
        if c != self.mean.len() {
            return Err(bad_input(
                Self::NAME,
                format!("{} channels against {} mean values", c, self.mean.len()),
            ));
        }
        let img = results.take_img()?;
        let shape = img.shape_vec();
        let mut data = img.into_data();
        for px in data.chunks_exact_mut(c) {
            if self.to_rgb {
                px.reverse();
            }
            for ((v, m), s) in px.iter_mut().zip(&self.mean).zip(&self.std) {
                *v = (*v - m) / s;
            }
        }
        results.put_img(Tensor::new(data, shape)?);
        results.img_norm_cfg = Some(ImgNormCfg {
            mean: self.mean.clone(),
            std: self.std.clone(),
            to_rgb: self.to_rgb,
        });
        Ok(())
    }
}

impl fmt::Display for Normalize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Normalize(mean={:?}, std={:?}, to_rgb={})", self.mean, self.std, self.to_rgb)
    }
}

// ─── RGB2Gray ───────────────────────────────────────────────────────────────

fn default_gray_weights() -> Vec<f64> {
    vec![0.299, 0.587, 0.114]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Rgb2GrayParams {
    #[serde(default)]
    out_channels: Option<i64>,
    #[serde(default = "default_gray_weights")]
    weights: Vec<f64>,
}

/// Weighted channel sum, replicated into `out_channels` identical planes
/// (as many as there are weights when unset).
#[derive(Debug, Clone)]
pub struct Rgb2Gray {
    out_channels: Option<usize>,
    weights: Vec<f64>,
}

impl Rgb2Gray {
    const NAME: &'static str = "RGB2Gray";

    pub fn new(out_channels: Option<i64>, weights: Vec<f64>) -> TransformResult<Self> {
        let out_channels = match out_channels {
            Some(n) if n <= 0 => {
                return Err(invalid(Self::NAME, format!("out_channels must be positive, got {}", n)))
            }
            other => other.map(|n| n as usize),
        };
        if weights.is_empty() {
            return Err(invalid(Self::NAME, "weights must not be empty"));
        }
        Ok(Rgb2Gray { out_channels, weights })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: Rgb2GrayParams = params(cfg)?;
        Self::new(p.out_channels, p.weights)
    }
}

impl Transform for Rgb2Gray {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        let img = results.img()?;
        if img.ndim() != 3 {
            return Err(bad_input(Self::NAME, format!("expected an [H, W, C] image, got {}", img.shape())));
        }
        let (h, w, c) = dims(img)?;
        if c != self.weights.len() {
            return Err(bad_input(
                Self::NAME,
                format!("{} channels against {} weights", c, self.weights.len()),
            ));
        }
        let out_c = self.out_channels.unwrap_or(self.weights.len());
        let mut data = Vec::with_capacity(h * w * out_c);
        for px in img.data().chunks_exact(c) {
            let gray: f64 = px.iter().zip(&self.weights).map(|(&v, &wt)| v as f64 * wt).sum();
            data.extend(std::iter::repeat(gray as f32).take(out_c));
        }
        results.put_img(Tensor::new(data, vec![h, w, out_c])?);
        Ok(())
    }
}

impl fmt::Display for Rgb2Gray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.out_channels {
            Some(n) => write!(f, "RGB2Gray(out_channels={}, weights=(", n)?,
            None => write!(f, "RGB2Gray(out_channels=None, weights=(")?,
        }
        for (i, w) in self.weights.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", w)?;
        }
        write!(f, "))")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use serde_json::json;

    fn run<T: Transform>(t: &T, results: &mut SegResults) {
        t.apply(results, &mut StdRng::seed_from_u64(0)).unwrap();
    }

    fn bgr_image() -> Tensor<f32> {
        // pixel (0, 0) is b=10, g=20, r=30
        let mut data = Vec::new();
        for i in 0..6 {
            data.extend_from_slice(&[10.0 + i as f32, 20.0 + i as f32, 30.0 + i as f32]);
        }
        Tensor::new(data, vec![2, 3, 3]).unwrap()
    }

    #[test]
    fn test_normalize_reorders_then_scales() {
        let norm = Normalize::from_config(&json!({
            "mean": [123.675, 116.28, 103.53], "std": [58.395, 57.12, 57.375], "to_rgb": true
        }))
        .unwrap();
        let mut results = SegResults::from_image(bgr_image());
        run(&norm, &mut results);
        let out = results.img().unwrap();
        assert_relative_eq!(out.get(&[0, 0, 0]).unwrap(), (30.0 - 123.675) / 58.395, epsilon = 1e-5);
        assert_relative_eq!(out.get(&[0, 0, 2]).unwrap(), (10.0 - 103.53) / 57.375, epsilon = 1e-5);
        assert_eq!(results.img_norm_cfg.as_ref().map(|c| c.to_rgb), Some(true));
    }

    #[test]
    fn test_normalize_keeps_order_without_to_rgb() {
        let norm = Normalize::new(vec![10.0, 20.0, 30.0], vec![2.0, 2.0, 2.0], false).unwrap();
        let mut results = SegResults::from_image(bgr_image());
        run(&norm, &mut results);
        assert_eq!(&results.img().unwrap().data()[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&results.img().unwrap().data()[3..6], &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_normalize_validation() {
        assert!(Normalize::new(vec![1.0, 2.0], vec![1.0], true).is_err());
        assert!(Normalize::new(vec![1.0], vec![0.0], true).is_err());
        let one_channel = Normalize::new(vec![1.0], vec![1.0], false).unwrap();
        let mut results = SegResults::from_image(bgr_image());
        assert!(one_channel.apply(&mut results, &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn test_rgb2gray_default_replicates() {
        let gray = Rgb2Gray::from_config(&json!({})).unwrap();
        assert_eq!(gray.to_string(), "RGB2Gray(out_channels=None, weights=(0.299, 0.587, 0.114))");
        let mut results = SegResults::from_image(bgr_image());
        run(&gray, &mut results);
        assert_eq!(results.img_shape, vec![2, 3, 3]);
        let expected = 10.0 * 0.299 + 20.0 * 0.587 + 30.0 * 0.114;
        let px = &results.img().unwrap().data()[..3];
        for &v in px {
            assert_relative_eq!(v, expected as f32, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rgb2gray_out_channels() {
        assert!(Rgb2Gray::from_config(&json!({"out_channels": -1})).is_err());
        let gray = Rgb2Gray::from_config(&json!({"out_channels": 2})).unwrap();
        let mut results = SegResults::from_image(bgr_image());
        run(&gray, &mut results);
        assert_eq!(results.img().unwrap().shape_vec(), vec![2, 3, 2]);

        let mismatched = Rgb2Gray::new(None, vec![0.5, 0.5]).unwrap();
        let mut results = SegResults::from_image(bgr_image());
        assert!(mismatched.apply(&mut results, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
