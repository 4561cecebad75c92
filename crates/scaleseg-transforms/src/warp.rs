//! Pixel-level resampling of `[H, W]` and `[H, W, C]` arrays.

use scaleseg_core::resample::{linear_taps, nearest_index};
use scaleseg_core::{Element, Tensor, TensorError, TensorResult};

/// `(H, W, C)` of a label map (`C = 1`) or an image.
pub fn dims<T: Element>(t: &Tensor<T>) -> TensorResult<(usize, usize, usize)> {
    let (h, w) = t.shape().hw()?;
    let c = if t.ndim() == 3 { t.shape().dims()[2] } else { 1 };
    Ok((h, w, c))
}

fn shaped<T: Element>(like: &Tensor<T>, data: Vec<T>, h: usize, w: usize) -> TensorResult<Tensor<T>> {
    let mut shape = like.shape_vec();
    shape[0] = h;
    shape[1] = w;
    Tensor::new(data, shape)
}

fn check_size(h: usize, w: usize, out_h: usize, out_w: usize) -> TensorResult<()> {
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        return Err(TensorError::InvalidOperation(format!(
            "cannot resize ({}, {}) to ({}, {})",
            h, w, out_h, out_w
        )));
    }
    Ok(())
}

/// Nearest-neighbour resize; safe for discrete label values.
pub fn resize_nearest<T: Element>(src: &Tensor<T>, out_h: usize, out_w: usize) -> TensorResult<Tensor<T>> {
    let (h, w, c) = dims(src)?;
    check_size(h, w, out_h, out_w)?;
    let x = src.data();
    let cols: Vec<usize> = (0..out_w).map(|ox| nearest_index(ox, w, out_w)).collect();
    let mut data = Vec::with_capacity(out_h * out_w * c);
    for oy in 0..out_h {
        let row = nearest_index(oy, h, out_h) * w;
        for &ix in &cols {
            let p = (row + ix) * c;
            data.extend_from_slice(&x[p..p + c]);
        }
    }
    shaped(src, data, out_h, out_w)
}

/// Bilinear resize with half-pixel centres.
pub fn resize_bilinear(src: &Tensor<f32>, out_h: usize, out_w: usize) -> TensorResult<Tensor<f32>> {
    let (h, w, c) = dims(src)?;
    check_size(h, w, out_h, out_w)?;
    let x = src.data();
    let cols: Vec<_> = (0..out_w).map(|ox| linear_taps(ox, w, out_w)).collect();
    let mut data = Vec::with_capacity(out_h * out_w * c);
    for oy in 0..out_h {
        let (y0, y1, wy0, wy1) = linear_taps(oy, h, out_h);
        for &(x0, x1, wx0, wx1) in &cols {
            for ch in 0..c {
                let at = |y: usize, xx: usize| x[(y * w + xx) * c + ch];
                data.push(wy0 * (wx0 * at(y0, x0) + wx1 * at(y0, x1)) + wy1 * (wx0 * at(y1, x0) + wx1 * at(y1, x1)));
            }
        }
    }
    shaped(src, data, out_h, out_w)
}

/// A 2×3 affine map `[a, b, c; d, e, f]` from source to destination pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [f64; 6]);

impl Affine {
    /// Rotation by `angle` degrees counter-clockwise about `center`, in the
    /// image coordinate frame (y pointing down).
    pub fn rotation(center: (f64, f64), angle: f64) -> Self {
        let (cx, cy) = center;
        let (sin, cos) = angle.to_radians().sin_cos();
        Affine([cos, sin, (1.0 - cos) * cx - sin * cy, -sin, cos, sin * cx + (1.0 - cos) * cy])
    }

    pub fn translate(mut self, dx: f64, dy: f64) -> Self {
        self.0[2] += dx;
        self.0[5] += dy;
        self
    }

    pub fn inverse(&self) -> TensorResult<Self> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * e - b * d;
        if det.abs() < 1e-12 {
            return Err(TensorError::InvalidOperation("affine map is singular".into()));
        }
        let (ia, ib, id, ie) = (e / det, -b / det, -d / det, a / det);
        Ok(Affine([ia, ib, -(ia * c + ib * f), id, ie, -(id * c + ie * f)]))
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + b * y + c, d * x + e * y + f)
    }
}

/// Warp into an `(out_h, out_w)` canvas, sampling the source at
/// `to_src(x, y)` with the nearest pixel; outside pixels take `border`.
pub fn warp_nearest<T: Element>(
    src: &Tensor<T>,
    to_src: &Affine,
    out_h: usize,
    out_w: usize,
    border: T,
) -> TensorResult<Tensor<T>> {
    let (h, w, c) = dims(src)?;
    let x = src.data();
    let mut data = Vec::with_capacity(out_h * out_w * c);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let (sx, sy) = to_src.apply(ox as f64, oy as f64);
            let (ix, iy) = (sx.round(), sy.round());
            if ix < 0.0 || iy < 0.0 || ix >= w as f64 || iy >= h as f64 {
                data.extend(std::iter::repeat(border).take(c));
            } else {
                let p = (iy as usize * w + ix as usize) * c;
                data.extend_from_slice(&x[p..p + c]);
            }
        }
    }
    shaped(src, data, out_h, out_w)
}

/// Bilinear counterpart of [`warp_nearest`]; taps outside the source read
/// `border`.
pub fn warp_bilinear(
    src: &Tensor<f32>,
    to_src: &Affine,
    out_h: usize,
    out_w: usize,
    border: f32,
) -> TensorResult<Tensor<f32>> {
    let (h, w, c) = dims(src)?;
    let x = src.data();
    let tap = |yy: i64, xx: i64, ch: usize| -> f32 {
        if yy < 0 || xx < 0 || yy >= h as i64 || xx >= w as i64 {
            border
        } else {
            x[(yy as usize * w + xx as usize) * c + ch]
        }
    };
    let mut data = Vec::with_capacity(out_h * out_w * c);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let (sx, sy) = to_src.apply(ox as f64, oy as f64);
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = ((sx - x0) as f32, (sy - y0) as f32);
            let (x0, y0) = (x0 as i64, y0 as i64);
            for ch in 0..c {
                let top = (1.0 - fx) * tap(y0, x0, ch) + fx * tap(y0, x0 + 1, ch);
                let bottom = (1.0 - fx) * tap(y0 + 1, x0, ch) + fx * tap(y0 + 1, x0 + 1, ch);
                data.push((1.0 - fy) * top + fy * bottom);
            }
        }
    }
    shaped(src, data, out_h, out_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_resize_nearest_labels() {
        let seg = Tensor::new(vec![1u8, 2, 3, 4], vec![2, 2]).unwrap();
        let up = resize_nearest(&seg, 4, 4).unwrap();
        assert_eq!(up.shape_vec(), vec![4, 4]);
        assert_eq!(&up.data()[..4], &[1, 1, 2, 2]);
        let down = resize_nearest(&up, 1, 2).unwrap();
        assert_eq!(down.data(), &[1, 2]);
    }

    #[test]
    fn test_resize_bilinear_keeps_channels() {
        let img = Tensor::new(vec![0.0, 10.0, 4.0, 20.0], vec![1, 2, 2]).unwrap();
        let out = resize_bilinear(&img, 1, 4).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 4, 2]);
        // channel 0 is [0, 4] resized to 4: [0, 1, 3, 4]
        let ch0: Vec<f32> = out.data().iter().step_by(2).copied().collect();
        for (a, b) in ch0.iter().zip([0.0, 1.0, 3.0, 4.0]) {
            assert_relative_eq!(*a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_affine_inverse_roundtrip() {
        let m = Affine::rotation((3.0, 2.0), 30.0).translate(1.5, -2.0);
        let inv = m.inverse().unwrap();
        let (x, y) = m.apply(4.0, 7.0);
        let (bx, by) = inv.apply(x, y);
        assert_relative_eq!(bx, 4.0, epsilon = 1e-9);
        assert_relative_eq!(by, 7.0, epsilon = 1e-9);
    }

    #[test]
    fn test_quarter_turn_moves_corner() {
        // 3x3 map; rotating 90 degrees about the centre moves (x=2, y=0) to (0, 0)
        let seg = Tensor::new((0u8..9).collect(), vec![3, 3]).unwrap();
        let to_src = Affine::rotation((1.0, 1.0), 90.0).inverse().unwrap();
        let out = warp_nearest(&seg, &to_src, 3, 3, 255).unwrap();
        assert_eq!(out.data(), &[2, 5, 8, 1, 4, 7, 0, 3, 6]);
    }

    #[test]
    fn test_warp_border_fill() {
        let img = Tensor::<f32>::full(vec![2, 2, 1], 1.0);
        let shift = Affine([1.0, 0.0, 5.0, 0.0, 1.0, 0.0]);
        let out = warp_bilinear(&img, &shift, 2, 2, 7.0).unwrap();
        assert!(out.data().iter().all(|&v| v == 7.0));
        let same = warp_bilinear(&img, &Affine([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]), 2, 2, 7.0).unwrap();
        assert!(same.data().iter().all(|&v| v == 1.0));
    }
}
