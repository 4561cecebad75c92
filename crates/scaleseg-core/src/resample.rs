//! Source-coordinate arithmetic shared by feature-map and image resampling.
//!
//! Both follow the half-pixel convention (`align_corners = false`).

/// Source index sampled by nearest-neighbour resizing from `in_size` to `out_size`.
#[inline]
pub fn nearest_index(dst: usize, in_size: usize, out_size: usize) -> usize {
    let scale = in_size as f32 / out_size as f32;
    ((dst as f32 * scale).floor() as usize).min(in_size - 1)
}

/// Neighbour indices and weights `(i0, i1, w0, w1)` for linear resizing.
#[inline]
pub fn linear_taps(dst: usize, in_size: usize, out_size: usize) -> (usize, usize, f32, f32) {
    let scale = in_size as f32 / out_size as f32;
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(in_size - 1);
    let i1 = (i0 + 1).min(in_size - 1);
    let w1 = src - i0 as f32;
    (i0, i1, 1.0 - w1, w1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_integer_ratio_replicates() {
        let idx: Vec<usize> = (0..6).map(|d| nearest_index(d, 3, 6)).collect();
        assert_eq!(idx, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_linear_taps_clamp_edges() {
        let (i0, i1, w0, w1) = linear_taps(0, 2, 4);
        assert_eq!((i0, i1), (0, 1));
        assert_eq!((w0, w1), (1.0, 0.0));

        let (i0, i1, _, w1) = linear_taps(3, 2, 4);
        assert_eq!((i0, i1), (1, 1));
        assert!((w1 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_identity_size() {
        for d in 0..5 {
            assert_eq!(nearest_index(d, 5, 5), d);
            let (i0, _, w0, _) = linear_taps(d, 5, 5);
            assert_eq!(i0, d);
            assert_eq!(w0, 1.0);
        }
    }
}
