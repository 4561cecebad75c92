use scaleseg_core::resample::{linear_taps, nearest_index};
use scaleseg_core::{Tensor, TensorError, TensorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    /// Bilinear with `align_corners = false`.
    Bilinear,
}

impl Interpolation {
    /// Nearest replication when the target is an integer multiple of the
    /// source on both axes, bilinear otherwise.
    pub fn for_upsample(src: (usize, usize), dst: (usize, usize)) -> Self {
        if dst.0 % src.0 == 0 && dst.1 % src.1 == 0 {
            Interpolation::Nearest
        } else {
            Interpolation::Bilinear
        }
    }
}

/// Resize the spatial axes of an `[N, C, H, W]` feature map to `size`.
pub fn interpolate(input: &Tensor<f32>, size: (usize, usize), mode: Interpolation) -> TensorResult<Tensor<f32>> {
    let (batch, channels, h, w) = input.shape().nchw()?;
    let (out_h, out_w) = size;
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        return Err(TensorError::InvalidOperation(format!(
            "cannot resize ({}, {}) to ({}, {})",
            h, w, out_h, out_w
        )));
    }
    if (h, w) == size {
        return Ok(input.clone());
    }

    let x = input.data();
    let mut output = Vec::with_capacity(batch * channels * out_h * out_w);
    match mode {
        Interpolation::Nearest => {
            let cols: Vec<usize> = (0..out_w).map(|ox| nearest_index(ox, w, out_w)).collect();
            for bc in 0..batch * channels {
                let src = &x[bc * h * w..(bc + 1) * h * w];
                for oy in 0..out_h {
                    let row = &src[nearest_index(oy, h, out_h) * w..];
                    output.extend(cols.iter().map(|&ix| row[ix]));
                }
            }
        }
        Interpolation::Bilinear => {
            let cols: Vec<_> = (0..out_w).map(|ox| linear_taps(ox, w, out_w)).collect();
            for bc in 0..batch * channels {
                let src = &x[bc * h * w..(bc + 1) * h * w];
                for oy in 0..out_h {
                    let (y0, y1, wy0, wy1) = linear_taps(oy, h, out_h);
                    let (r0, r1) = (&src[y0 * w..], &src[y1 * w..]);
                    output.extend(cols.iter().map(|&(x0, x1, wx0, wx1)| {
                        wy0 * (wx0 * r0[x0] + wx1 * r0[x1]) + wy1 * (wx0 * r1[x0] + wx1 * r1[x1])
                    }));
                }
            }
        }
    }

    Tensor::new(output, vec![batch, channels, out_h, out_w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mode_choice() {
        assert_eq!(Interpolation::for_upsample((2, 3), (8, 9)), Interpolation::Nearest);
        assert_eq!(Interpolation::for_upsample((2, 2), (8, 9)), Interpolation::Bilinear);
        assert_eq!(Interpolation::for_upsample((1, 1), (7, 5)), Interpolation::Nearest);
    }

    #[test]
    fn test_nearest_replicates() {
        let input = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 2, 2]).unwrap();
        let out = interpolate(&input, (4, 4), Interpolation::Nearest).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 1, 4, 4]);
        assert_eq!(&out.data()[..8], &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(out.get(&[0, 0, 3, 3]).unwrap(), 4.0);
    }

    #[test]
    fn test_bilinear_half_pixel() {
        let input = Tensor::new(vec![0.0, 4.0], vec![1, 1, 1, 2]).unwrap();
        let out = interpolate(&input, (1, 4), Interpolation::Bilinear).unwrap();
        // src x = (dst + 0.5) * 0.5 - 0.5 -> [0(clamped), 0.25, 0.75, 1.25(clamped to 1)]
        let expect = [0.0, 1.0, 3.0, 4.0];
        for (o, e) in out.data().iter().zip(expect.iter()) {
            assert_relative_eq!(*o, *e, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bilinear_constant_is_preserved() {
        let input = Tensor::<f32>::full(vec![2, 3, 2, 3], 5.0);
        let out = interpolate(&input, (7, 5), Interpolation::Bilinear).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 3, 7, 5]);
        assert!(out.data().iter().all(|&v| (v - 5.0).abs() < 1e-5));
    }
}
