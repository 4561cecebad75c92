use crate::error::{TensorError, TensorResult};
use serde::{Deserialize, Serialize};

/// Dimensions of a tensor, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Size along a specific axis.
    pub fn dim(&self, axis: usize) -> TensorResult<usize> {
        self.dims.get(axis).copied().ok_or(TensorError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims.clone()
    }

    /// Row-major (C-order) strides.
    pub fn strides(&self) -> Vec<usize> {
        if self.dims.is_empty() {
            return vec![];
        }
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    fn expect_rank(&self, rank: usize) -> TensorResult<()> {
        if self.ndim() != rank {
            return Err(TensorError::RankMismatch {
                expected: rank,
                got: self.to_vec(),
            });
        }
        Ok(())
    }

    /// Unpack a feature-map shape `[N, C, H, W]`.
    pub fn nchw(&self) -> TensorResult<(usize, usize, usize, usize)> {
        self.expect_rank(4)?;
        Ok((self.dims[0], self.dims[1], self.dims[2], self.dims[3]))
    }

    /// Unpack an image shape `[H, W, C]`.
    pub fn hwc(&self) -> TensorResult<(usize, usize, usize)> {
        self.expect_rank(3)?;
        Ok((self.dims[0], self.dims[1], self.dims[2]))
    }

    /// Height and width of an image (`[H, W, C]`) or label map (`[H, W]`).
    pub fn hw(&self) -> TensorResult<(usize, usize)> {
        match self.ndim() {
            2 | 3 => Ok((self.dims[0], self.dims[1])),
            _ => Err(TensorError::RankMismatch {
                expected: 3,
                got: self.to_vec(),
            }),
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let s = Shape::new(vec![2, 3, 4, 5]);
        assert_eq!(s.ndim(), 4);
        assert_eq!(s.numel(), 120);
        assert_eq!(s.dim(3).unwrap(), 5);
        assert!(s.dim(4).is_err());
    }

    #[test]
    fn test_strides() {
        let s = Shape::new(vec![3, 4, 5]);
        assert_eq!(s.strides(), vec![20, 5, 1]);
    }

    #[test]
    fn test_layout_helpers() {
        let s = Shape::new(vec![1, 8, 6, 7]);
        assert_eq!(s.nchw().unwrap(), (1, 8, 6, 7));
        assert!(s.hwc().is_err());

        let img = Shape::new(vec![288, 512, 3]);
        assert_eq!(img.hwc().unwrap(), (288, 512, 3));
        assert_eq!(img.hw().unwrap(), (288, 512));
        assert_eq!(Shape::new(vec![10, 20]).hw().unwrap(), (10, 20));
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(vec![750, 1333, 3]).to_string(), "(750, 1333, 3)");
    }
}
