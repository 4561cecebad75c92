use scaleseg_core::{Tensor, TensorError, TensorResult};

use crate::module::{join, Module};

/// Batch normalization over the channel axis of `[N, C, H, W]` feature maps.
///
/// In training mode the batch statistics normalize the input and update the
/// running estimates; in eval mode the running estimates are used.
pub struct BatchNorm2D {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    pub weight: Tensor<f32>,
    pub bias: Tensor<f32>,
    pub running_mean: Tensor<f32>,
    pub running_var: Tensor<f32>,
    training: bool,
}

impl BatchNorm2D {
    pub fn new(num_features: usize) -> Self {
        BatchNorm2D {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            weight: Tensor::ones(vec![num_features]),
            bias: Tensor::zeros(vec![num_features]),
            running_mean: Tensor::zeros(vec![num_features]),
            running_var: Tensor::ones(vec![num_features]),
            training: true,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn batch_stats(x: &[f32], batch: usize, channels: usize, plane: usize, c: usize) -> (f64, f64) {
        let n = (batch * plane) as f64;
        let mut sum = 0.0f64;
        for b in 0..batch {
            let base = (b * channels + c) * plane;
            sum += x[base..base + plane].iter().map(|&v| v as f64).sum::<f64>();
        }
        let mean = sum / n;
        let mut sq = 0.0f64;
        for b in 0..batch {
            let base = (b * channels + c) * plane;
            sq += x[base..base + plane]
                .iter()
                .map(|&v| (v as f64 - mean).powi(2))
                .sum::<f64>();
        }
        (mean, sq / n)
    }
}

impl Module for BatchNorm2D {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (batch, channels, h, w) = input.shape().nchw()?;
        if channels != self.num_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.num_features, h, w],
                got: input.shape_vec(),
            });
        }
        let plane = h * w;
        let count = batch * plane;
        let mut out = input.clone();

        for c in 0..channels {
            let (mean, var) = if self.training {
                let (mean, var) = Self::batch_stats(input.data(), batch, channels, plane, c);
                let m = self.momentum as f64;
                let unbiased = if count > 1 {
                    var * count as f64 / (count - 1) as f64
                } else {
                    var
                };
                let rm = &mut self.running_mean.data_mut()[c];
                *rm = ((1.0 - m) * *rm as f64 + m * mean) as f32;
                let rv = &mut self.running_var.data_mut()[c];
                *rv = ((1.0 - m) * *rv as f64 + m * unbiased) as f32;
                (mean as f32, var as f32)
            } else {
                (self.running_mean.data()[c], self.running_var.data()[c])
            };

            let scale = self.weight.data()[c] / (var + self.eps).sqrt();
            let shift = self.bias.data()[c] - mean * scale;
            for b in 0..batch {
                let base = (b * channels + c) * plane;
                for v in &mut out.data_mut()[base..base + plane] {
                    *v = *v * scale + shift;
                }
            }
        }
        Ok(out)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        f(join(prefix, "weight"), &self.weight);
        f(join(prefix, "bias"), &self.bias);
        f(join(prefix, "running_mean"), &self.running_mean);
        f(join(prefix, "running_var"), &self.running_var);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        f(join(prefix, "weight"), &mut self.weight);
        f(join(prefix, "bias"), &mut self.bias);
        f(join(prefix, "running_mean"), &mut self.running_mean);
        f(join(prefix, "running_var"), &mut self.running_var);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        f(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp() -> Tensor<f32> {
        // two channels: 0..4 and 10..14
        let data = vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0];
        Tensor::new(data, vec![1, 2, 2, 2]).unwrap()
    }

    #[test]
    fn test_training_normalizes_batch() {
        let mut bn = BatchNorm2D::new(2);
        let out = bn.forward(&ramp()).unwrap();
        for c in 0..2 {
            let ch = out.narrow(1, c, 1).unwrap();
            assert_relative_eq!(ch.mean_all(), 0.0, epsilon = 1e-5);
            let var = ch.apply(|x| x * x).mean_all();
            assert_relative_eq!(var, 1.0, epsilon = 1e-3);
        }
        // running_mean = 0.9 * 0 + 0.1 * 1.5
        assert_relative_eq!(bn.running_mean.data()[0], 0.15, epsilon = 1e-6);
        // unbiased var of [0,1,2,3] = 5/3
        assert_relative_eq!(bn.running_var.data()[0], 0.9 + 0.1 * 5.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_eval_uses_running_stats() {
        let mut bn = BatchNorm2D::new(2);
        bn.set_training(false);
        let input = ramp();
        let out = bn.forward(&input).unwrap();
        // identity up to eps with fresh running stats
        assert!(out.allclose(&input, 1e-3));
        assert_eq!(bn.running_mean.data(), &[0.0, 0.0]);
    }

    #[test]
    fn test_channel_mismatch() {
        let mut bn = BatchNorm2D::new(3);
        assert!(bn.forward(&ramp()).is_err());
    }
}
