use scaleseg_core::{Tensor, TensorError, TensorResult};

use crate::module::Module;

/// Max Pooling 2D over `[N, C, H, W]`.
///
/// Kernel and stride are given per axis so that non-square windows can be
/// expressed. Padding counts as `-inf`; output size rounds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2D {
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: usize,
}

impl MaxPool2D {
    /// Square window with stride equal to the window.
    pub fn new(kernel_size: usize) -> Self {
        MaxPool2D {
            kernel_size: (kernel_size, kernel_size),
            stride: (kernel_size, kernel_size),
            padding: 0,
        }
    }

    pub fn with_stride(kernel_size: usize, stride: usize, padding: usize) -> Self {
        MaxPool2D {
            kernel_size: (kernel_size, kernel_size),
            stride: (stride, stride),
            padding,
        }
    }

    fn out_dim(input: usize, kernel: usize, stride: usize, padding: usize) -> TensorResult<usize> {
        let padded = input + 2 * padding;
        if kernel == 0 || stride == 0 || padded < kernel {
            return Err(TensorError::InvalidOperation(format!(
                "MaxPool2D window {} (stride {}) does not fit input {} with padding {}",
                kernel, stride, input, padding
            )));
        }
        Ok((padded - kernel) / stride + 1)
    }

    pub fn forward_tensor(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (batch, channels, h, w) = input.shape().nchw()?;
        let (kh, kw) = self.kernel_size;
        let (sh, sw) = self.stride;
        let p = self.padding as isize;
        let out_h = Self::out_dim(h, kh, sh, self.padding)?;
        let out_w = Self::out_dim(w, kw, sw, self.padding)?;

        let x = input.data();
        let mut output = vec![f32::NEG_INFINITY; batch * channels * out_h * out_w];

        for bc in 0..batch * channels {
            let src = &x[bc * h * w..(bc + 1) * h * w];
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut max_val = f32::NEG_INFINITY;
                    for ky in 0..kh {
                        let iy = (oh * sh + ky) as isize - p;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ow * sw + kx) as isize - p;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let val = src[iy as usize * w + ix as usize];
                            if val > max_val {
                                max_val = val;
                            }
                        }
                    }
                    output[(bc * out_h + oh) * out_w + ow] = max_val;
                }
            }
        }

        Tensor::new(output, vec![batch, channels, out_h, out_w])
    }
}

impl Module for MaxPool2D {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.forward_tensor(input)
    }

    fn visit(&self, _prefix: &str, _f: &mut dyn FnMut(String, &Tensor<f32>)) {}

    fn visit_mut(&mut self, _prefix: &str, _f: &mut dyn FnMut(String, &mut Tensor<f32>)) {}
}
