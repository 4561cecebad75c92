use crate::dtype::{Element, Float};
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// N-dimensional tensor, the fundamental data structure of scaleseg.
///
/// Stores data in a flat contiguous `Vec<T>` with row-major (C-order) layout.
/// Feature maps are `[N, C, H, W]`, images `[H, W, C]`, label maps `[H, W]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Element")]
pub struct Tensor<T: Element> {
    data: Vec<T>,
    shape: Shape,
}

// ─── Construction ───────────────────────────────────────────────────────────

impl<T: Element> Tensor<T> {
    /// Create a tensor from raw data and shape.
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> TensorResult<Self> {
        let s = Shape::new(shape);
        if data.len() != s.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: s.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape: s })
    }

    /// Create a tensor filled with the element default (zero).
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, T::default())
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let s = Shape::new(shape);
        Tensor {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    fn offset(&self, indices: &[usize]) -> TensorResult<usize> {
        if indices.len() != self.ndim() {
            return Err(TensorError::RankMismatch {
                expected: self.ndim(),
                got: indices.to_vec(),
            });
        }
        let strides = self.shape.strides();
        let mut offset = 0;
        for (axis, &idx) in indices.iter().enumerate() {
            let size = self.shape.dims()[axis];
            if idx >= size {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    axis,
                    size,
                });
            }
            offset += idx * strides[axis];
        }
        Ok(offset)
    }

    /// Multi-dimensional indexing.
    pub fn get(&self, indices: &[usize]) -> TensorResult<T> {
        Ok(self.data[self.offset(indices)?])
    }

    // ─── Shape Manipulation ─────────────────────────────────────────────────

    /// Reshape the tensor (data remains the same, only shape changes).
    pub fn reshape(&self, new_shape: Vec<usize>) -> TensorResult<Tensor<T>> {
        let ns = Shape::new(new_shape);
        if self.numel() != ns.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: ns.to_vec(),
                got: self.shape_vec(),
            });
        }
        Ok(Tensor {
            data: self.data.clone(),
            shape: ns,
        })
    }

    /// Element-wise conversion into another element type.
    pub fn map<U: Element, F: Fn(T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Concatenate tensors along `axis`. All other dimensions must agree.
    pub fn concatenate(tensors: &[&Tensor<T>], axis: usize) -> TensorResult<Tensor<T>> {
        let first = tensors.first().ok_or(TensorError::EmptyTensor)?;
        let ndim = first.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }

        let ref_shape = first.shape_vec();
        for t in &tensors[1..] {
            let same_rank = t.ndim() == ndim;
            let agrees = same_rank
                && ref_shape
                    .iter()
                    .zip(t.shape.dims())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !agrees {
                return Err(TensorError::ShapeMismatch {
                    expected: ref_shape.clone(),
                    got: t.shape_vec(),
                });
            }
        }

        let outer: usize = ref_shape[..axis].iter().product();
        let inner: usize = ref_shape[axis + 1..].iter().product();
        let new_axis_size: usize = tensors.iter().map(|t| t.shape.dims()[axis]).sum();

        let mut data = Vec::with_capacity(outer * new_axis_size * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape.dims()[axis] * inner;
                let start = o * chunk;
                data.extend_from_slice(&t.data[start..start + chunk]);
            }
        }

        let mut new_shape = ref_shape;
        new_shape[axis] = new_axis_size;
        Tensor::new(data, new_shape)
    }

    /// Stack equally-shaped tensors along a new leading axis.
    pub fn stack(tensors: &[&Tensor<T>]) -> TensorResult<Tensor<T>> {
        let first = tensors.first().ok_or(TensorError::EmptyTensor)?;
        let mut data = Vec::with_capacity(first.numel() * tensors.len());
        for t in tensors {
            if t.shape != first.shape {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape_vec(),
                    got: t.shape_vec(),
                });
            }
            data.extend_from_slice(&t.data);
        }
        let mut shape = vec![tensors.len()];
        shape.extend_from_slice(first.shape.dims());
        Tensor::new(data, shape)
    }

    /// Take `len` entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> TensorResult<Tensor<T>> {
        let ndim = self.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }
        let dims = self.shape.dims();
        if start + len > dims[axis] {
            return Err(TensorError::IndexOutOfBounds {
                index: start + len,
                axis,
                size: dims[axis],
            });
        }
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * dims[axis] + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut new_shape = dims.to_vec();
        new_shape[axis] = len;
        Tensor::new(data, new_shape)
    }

    /// Reverse the order of entries along `axis`.
    pub fn flip_axis(&self, axis: usize) -> TensorResult<Tensor<T>> {
        let ndim = self.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }
        let dims = self.shape.dims();
        let outer: usize = dims[..axis].iter().product();
        let size = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(self.numel());
        for o in 0..outer {
            for i in (0..size).rev() {
                let base = (o * size + i) * inner;
                data.extend_from_slice(&self.data[base..base + inner]);
            }
        }
        Tensor::new(data, dims.to_vec())
    }

    /// Crop rows `y1..y2` and columns `x1..x2` of an `[H, W]` or `[H, W, C]` tensor.
    /// Bounds are clipped to the tensor extent.
    pub fn crop_hw(&self, y1: usize, y2: usize, x1: usize, x2: usize) -> TensorResult<Tensor<T>> {
        let (h, w) = self.shape.hw()?;
        let (y2, x2) = (y2.min(h), x2.min(w));
        let (y1, x1) = (y1.min(y2), x1.min(x2));
        let c = self.data.len() / (h * w).max(1);
        let mut data = Vec::with_capacity((y2 - y1) * (x2 - x1) * c);
        for y in y1..y2 {
            let row = (y * w + x1) * c;
            data.extend_from_slice(&self.data[row..row + (x2 - x1) * c]);
        }
        let mut shape = self.shape_vec();
        shape[0] = y2 - y1;
        shape[1] = x2 - x1;
        Tensor::new(data, shape)
    }

    /// Pad an `[H, W]` or `[H, W, C]` tensor at the bottom and right up to
    /// `(out_h, out_w)`.
    pub fn pad_hw(&self, out_h: usize, out_w: usize, value: T) -> TensorResult<Tensor<T>> {
        let (h, w) = self.shape.hw()?;
        if out_h < h || out_w < w {
            return Err(TensorError::InvalidOperation(format!(
                "cannot pad ({}, {}) down to ({}, {})",
                h, w, out_h, out_w
            )));
        }
        let c = self.data.len() / (h * w).max(1);
        let mut shape = self.shape_vec();
        shape[0] = out_h;
        shape[1] = out_w;
        let mut out = Tensor::full(shape, value);
        for y in 0..h {
            let src = y * w * c;
            let dst = y * out_w * c;
            out.data[dst..dst + w * c].copy_from_slice(&self.data[src..src + w * c]);
        }
        Ok(out)
    }

    /// `[H, W, C]` image layout to `[C, H, W]` planar layout.
    pub fn hwc_to_chw(&self) -> TensorResult<Tensor<T>> {
        let (h, w, c) = self.shape.hwc()?;
        let mut data = vec![T::default(); self.numel()];
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    data[(ch * h + y) * w + x] = self.data[(y * w + x) * c + ch];
                }
            }
        }
        Tensor::new(data, vec![c, h, w])
    }
}

// ─── Float operations ───────────────────────────────────────────────────────

impl<T: Float> Tensor<T> {
    /// Create a tensor filled with ones.
    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ONE)
    }

    /// Random tensor drawn from `N(mean, std²)` using the given generator.
    ///
    /// Uses the Box-Muller transform, two samples per pair of uniforms.
    pub fn randn_with<R: Rng + ?Sized>(shape: Vec<usize>, mean: f64, std: f64, rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let n = s.numel();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let u1: f64 = rng.gen::<f64>().max(1e-10);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            data.push(T::from_f64(mean + std * r * theta.cos()));
            data.push(T::from_f64(mean + std * r * theta.sin()));
        }
        data.truncate(n);
        Tensor { data, shape: s }
    }

    /// Standard-normal random tensor.
    pub fn randn(shape: Vec<usize>, seed: Option<u64>) -> Self {
        Self::randn_with(shape, 0.0, 1.0, &mut seeded(seed))
    }

    pub fn apply<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        self.map(f)
    }

    pub fn apply_mut<F: Fn(T) -> T>(&mut self, f: F) {
        for x in self.data.iter_mut() {
            *x = f(*x);
        }
    }

    pub fn relu(&self) -> Tensor<T> {
        self.apply(|x| if x > T::ZERO { x } else { T::ZERO })
    }

    pub fn relu_mut(&mut self) {
        self.apply_mut(|x| if x > T::ZERO { x } else { T::ZERO });
    }

    pub fn add_scalar(&self, s: T) -> Tensor<T> { self.apply(|x| x + s) }

    /// Element-wise sum of two equally-shaped tensors.
    pub fn add(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let mut out = self.clone();
        out.add_assign(other)?;
        Ok(out)
    }

    pub fn add_assign(&mut self, other: &Tensor<T>) -> TensorResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape_vec(),
                got: other.shape_vec(),
            });
        }
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    pub fn mean_all(&self) -> T {
        if self.data.is_empty() {
            return T::ZERO;
        }
        self.data.iter().copied().sum::<T>() / T::from_usize(self.numel())
    }

    pub fn max_all(&self) -> TensorResult<T> {
        self.data
            .iter()
            .copied()
            .fold(None, |acc: Option<T>, x| Some(acc.map_or(x, |m| m.max(x))))
            .ok_or(TensorError::EmptyTensor)
    }

    /// Index of the maximum along `axis`; the axis is removed from the result.
    pub fn argmax_axis(&self, axis: usize) -> TensorResult<Tensor<T>> {
        let ndim = self.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }
        let dims = self.shape.dims();
        let size = dims[axis];
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let mut best = 0;
                let mut best_val = T::NEG_INFINITY;
                for k in 0..size {
                    let v = self.data[(o * size + k) * inner + i];
                    if v > best_val {
                        best_val = v;
                        best = k;
                    }
                }
                data.push(T::from_usize(best));
            }
        }
        let mut shape = dims.to_vec();
        shape.remove(axis);
        Tensor::new(data, shape)
    }

    /// True when shapes agree and every element is within `tol`.
    pub fn allclose(&self, other: &Tensor<T>, tol: T) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(&a, &b)| (a - b).abs() <= tol)
    }
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_length() {
        assert!(Tensor::<f32>::new(vec![1.0; 5], vec![2, 3]).is_err());
        assert!(Tensor::<f32>::new(vec![1.0; 6], vec![2, 3]).is_ok());
    }

    #[test]
    fn test_get_uses_row_major_offsets() {
        let t = Tensor::new((0..24).map(|i| i as f32).collect(), vec![2, 3, 4]).unwrap();
        assert_eq!(t.get(&[1, 2, 3]).unwrap(), 23.0);
        assert_eq!(t.get(&[0, 1, 2]).unwrap(), 6.0);
        assert!(t.get(&[2, 0, 0]).is_err());
        assert!(t.get(&[0, 0]).is_err());
    }

    #[test]
    fn test_concatenate_channels() {
        let a = Tensor::<f32>::full(vec![1, 2, 2, 2], 1.0);
        let b = Tensor::<f32>::full(vec![1, 3, 2, 2], 2.0);
        let c = Tensor::concatenate(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape_vec(), vec![1, 5, 2, 2]);
        assert_eq!(c.get(&[0, 1, 1, 1]).unwrap(), 1.0);
        assert_eq!(c.get(&[0, 2, 0, 0]).unwrap(), 2.0);

        let bad = Tensor::<f32>::zeros(vec![1, 3, 3, 2]);
        assert!(Tensor::concatenate(&[&a, &bad], 1).is_err());
    }

    #[test]
    fn test_narrow_and_stack() {
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![3, 4]).unwrap();
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.data(), &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);

        let s = Tensor::stack(&[&n, &n]).unwrap();
        assert_eq!(s.shape_vec(), vec![2, 3, 2]);
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let t = Tensor::new((0..24u8).collect(), vec![2, 4, 3]).unwrap();
        let f = t.flip_axis(1).unwrap();
        assert_eq!(f.get(&[0, 0, 0]).unwrap(), 9);
        assert_eq!(f.flip_axis(1).unwrap(), t);
    }

    #[test]
    fn test_crop_and_pad() {
        let t = Tensor::new((0..20u8).collect(), vec![4, 5]).unwrap();
        let c = t.crop_hw(1, 3, 2, 5).unwrap();
        assert_eq!(c.shape_vec(), vec![2, 3]);
        assert_eq!(c.data(), &[7, 8, 9, 12, 13, 14]);

        let p = c.pad_hw(4, 4, 255).unwrap();
        assert_eq!(p.shape_vec(), vec![4, 4]);
        assert_eq!(p.get(&[0, 0]).unwrap(), 7);
        assert_eq!(p.get(&[0, 3]).unwrap(), 255);
        assert_eq!(p.get(&[3, 0]).unwrap(), 255);
        assert!(p.pad_hw(2, 2, 0).is_err());
    }

    #[test]
    fn test_hwc_to_chw() {
        let t = Tensor::new(vec![1.0f32, 10.0, 2.0, 20.0], vec![1, 2, 2]).unwrap();
        let p = t.hwc_to_chw().unwrap();
        assert_eq!(p.shape_vec(), vec![2, 1, 2]);
        assert_eq!(p.data(), &[1.0, 2.0, 10.0, 20.0]);
    }

    #[test]
    fn test_argmax_drops_axis() {
        let t = Tensor::new(vec![1.0f64, 3.0, 2.0, 0.0], vec![1, 2, 2]).unwrap();
        let a = t.argmax_axis(1).unwrap();
        assert_eq!(a.shape_vec(), vec![1, 2]);
        assert_eq!(a.data(), &[1.0, 0.0]);
        assert!(t.argmax_axis(3).is_err());
    }

    #[test]
    fn test_randn_moments() {
        let t = Tensor::<f64>::randn(vec![20_000], Some(7));
        let mean = t.mean_all();
        let var = t.apply(|x| (x - mean) * (x - mean)).mean_all();
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_relu_and_add() {
        let a = Tensor::new(vec![-1.0f32, 2.0], vec![2]).unwrap();
        let b = a.relu().add(&a).unwrap();
        assert_eq!(b.data(), &[-1.0, 4.0]);
        assert!(a.add(&Tensor::zeros(vec![3])).is_err());
    }
}
