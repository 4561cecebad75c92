use rand::Rng;
use rayon::prelude::*;
use scaleseg_core::{Tensor, TensorError, TensorResult};

use crate::module::{join, Module};
use crate::norm::BatchNorm2D;

/// Geometry of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2DConfig {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
}

impl Default for Conv2DConfig {
    fn default() -> Self {
        Conv2DConfig {
            stride: 1,
            padding: 0,
            dilation: 1,
        }
    }
}

impl Conv2DConfig {
    /// Stride 1 with `padding = dilation`, which keeps the size for 3×3 kernels.
    pub fn same(dilation: usize) -> Self {
        Conv2DConfig {
            stride: 1,
            padding: dilation,
            dilation,
        }
    }
}

/// 2D Convolution layer.
///
/// Input shape:  [batch, in_channels, height, width]
/// Output shape: [batch, out_channels, out_h, out_w]
pub struct Conv2D {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub config: Conv2DConfig,
    pub weight: Tensor<f32>, // [out_channels, in_channels, kH, kW]
    pub bias: Option<Tensor<f32>>,
}

impl Conv2D {
    /// Weights drawn from `N(0, 2 / (kH * kW * out_channels))`, bias zero.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        config: Conv2DConfig,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_out = kernel_size.0 * kernel_size.1 * out_channels;
        let std = (2.0 / fan_out as f64).sqrt();
        let weight = Tensor::randn_with(
            vec![out_channels, in_channels, kernel_size.0, kernel_size.1],
            0.0,
            std,
            rng,
        );
        let bias = bias.then(|| Tensor::zeros(vec![out_channels]));

        Conv2D {
            in_channels,
            out_channels,
            kernel_size,
            config,
            weight,
            bias,
        }
    }

    /// 1×1 convolution without bias.
    pub fn pointwise<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self::new(in_channels, out_channels, (1, 1), Conv2DConfig::default(), false, rng)
    }

    /// Compute output spatial dimension.
    pub fn out_dim(&self, input_dim: usize, kernel: usize) -> TensorResult<usize> {
        let c = self.config;
        let span = c.dilation * (kernel - 1) + 1;
        let padded = input_dim + 2 * c.padding;
        if padded < span {
            return Err(TensorError::InvalidOperation(format!(
                "Conv2D kernel span {} exceeds padded input {}",
                span, padded
            )));
        }
        Ok((padded - span) / c.stride + 1)
    }

    pub fn forward_tensor(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (batch, in_ch, h, w) = input.shape().nchw()?;
        if in_ch != self.in_channels {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.in_channels, h, w],
                got: input.shape_vec(),
            });
        }
        let (kh, kw) = self.kernel_size;
        let out_h = self.out_dim(h, kh)?;
        let out_w = self.out_dim(w, kw)?;
        let Conv2DConfig {
            stride,
            padding,
            dilation,
        } = self.config;

        let x = input.data();
        let wt = self.weight.data();
        let plane = out_h * out_w;
        let mut output = vec![0.0f32; batch * self.out_channels * plane];

        output
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(idx, out)| {
                let b = idx / self.out_channels;
                let oc = idx % self.out_channels;
                if let Some(bias) = &self.bias {
                    out.fill(bias.data()[oc]);
                }
                for ic in 0..in_ch {
                    let src = &x[(b * in_ch + ic) * h * w..(b * in_ch + ic + 1) * h * w];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let wv = wt[((oc * in_ch + ic) * kh + ky) * kw + kx];
                            if wv == 0.0 {
                                continue;
                            }
                            for oy in 0..out_h {
                                let iy = (oy * stride + ky * dilation) as isize - padding as isize;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                let row = &src[iy as usize * w..(iy as usize + 1) * w];
                                let dst = &mut out[oy * out_w..(oy + 1) * out_w];
                                for (ox, o) in dst.iter_mut().enumerate() {
                                    let ix = (ox * stride + kx * dilation) as isize - padding as isize;
                                    if ix >= 0 && ix < w as isize {
                                        *o += wv * row[ix as usize];
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Tensor::new(output, vec![batch, self.out_channels, out_h, out_w])
    }
}

impl Module for Conv2D {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.forward_tensor(input)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        f(join(prefix, "weight"), &self.weight);
        if let Some(b) = &self.bias {
            f(join(prefix, "bias"), b);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        f(join(prefix, "weight"), &mut self.weight);
        if let Some(b) = &mut self.bias {
            f(join(prefix, "bias"), b);
        }
    }
}

/// Convolution followed by batch-norm, optionally with a ReLU.
///
/// Parameters are named `conv.*` and `bn.*`.
pub struct ConvBN {
    pub conv: Conv2D,
    pub bn: BatchNorm2D,
    pub relu: bool,
}

impl ConvBN {
    pub fn new(conv: Conv2D, relu: bool) -> Self {
        let bn = BatchNorm2D::new(conv.out_channels);
        ConvBN { conv, bn, relu }
    }
}

impl Module for ConvBN {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut out = self.bn.forward(&self.conv.forward_tensor(input)?)?;
        if self.relu {
            out.relu_mut();
        }
        Ok(out)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        self.conv.visit(&join(prefix, "conv"), f);
        self.bn.visit(&join(prefix, "bn"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        self.conv.visit_mut(&join(prefix, "conv"), f);
        self.bn.visit_mut(&join(prefix, "bn"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.bn.set_training(training);
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        f(&mut self.bn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_conv2d_valid() {
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let input = Tensor::new(data, vec![1, 1, 4, 4]).unwrap();
        let conv = Conv2D::new(1, 2, (3, 3), Conv2DConfig::default(), false, &mut rng());
        let out = conv.forward_tensor(&input).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 2, 2, 2]); // (4-3)/1+1 = 2
    }

    #[test]
    fn test_conv2d_same_padding_with_dilation() {
        let input = Tensor::<f32>::ones(vec![2, 3, 9, 7]);
        for d in [1, 2, 4] {
            let conv = Conv2D::new(3, 5, (3, 3), Conv2DConfig::same(d), false, &mut rng());
            let out = conv.forward_tensor(&input).unwrap();
            assert_eq!(out.shape_vec(), vec![2, 5, 9, 7]);
        }
    }

    #[test]
    fn test_conv2d_known_values() {
        // Sum kernel over a 3x3 ramp with zero padding.
        let input = Tensor::new((1..=9).map(|i| i as f32).collect(), vec![1, 1, 3, 3]).unwrap();
        let mut conv = Conv2D::new(1, 1, (3, 3), Conv2DConfig::same(1), true, &mut rng());
        conv.weight = Tensor::ones(vec![1, 1, 3, 3]);
        conv.bias = Some(Tensor::full(vec![1], 0.5));
        let out = conv.forward_tensor(&input).unwrap();
        // centre sees all nine values, corner (0,0) sees 1+2+4+5
        assert_eq!(out.get(&[0, 0, 1, 1]).unwrap(), 45.5);
        assert_eq!(out.get(&[0, 0, 0, 0]).unwrap(), 12.5);
    }

    #[test]
    fn test_conv2d_stride_and_pointwise() {
        let input = Tensor::<f32>::ones(vec![1, 4, 8, 8]);
        let conv = Conv2D::new(4, 2, (7, 7), Conv2DConfig { stride: 2, padding: 3, dilation: 1 }, false, &mut rng());
        assert_eq!(conv.forward_tensor(&input).unwrap().shape_vec(), vec![1, 2, 4, 4]);

        let mut pw = Conv2D::pointwise(4, 3, &mut rng());
        pw.weight = Tensor::ones(vec![3, 4, 1, 1]);
        let out = pw.forward_tensor(&input).unwrap();
        assert!(out.data().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_conv2d_rejects_channel_mismatch() {
        let conv = Conv2D::pointwise(3, 2, &mut rng());
        assert!(conv.forward_tensor(&Tensor::zeros(vec![1, 4, 2, 2])).is_err());
    }

    #[test]
    fn test_init_scale() {
        let conv = Conv2D::new(64, 64, (3, 3), Conv2DConfig::same(1), false, &mut rng());
        let w = &conv.weight;
        let var = w.apply(|x| x * x).mean_all();
        let expected = 2.0 / (9.0 * 64.0);
        assert!((var - expected).abs() / expected < 0.1);
    }
}
