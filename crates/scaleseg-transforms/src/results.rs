use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use scaleseg_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{TransformError, TransformResult};

/// Name of the main label map in [`SegResults::seg_fields`].
pub const GT_SEMANTIC_SEG: &str = "gt_semantic_seg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipDirection {
    Horizontal,
    Vertical,
}

impl FlipDirection {
    /// Axis of an `[H, W, ...]` array that the flip reverses.
    pub fn axis(self) -> usize {
        match self {
            FlipDirection::Horizontal => 1,
            FlipDirection::Vertical => 0,
        }
    }
}

impl fmt::Display for FlipDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipDirection::Horizontal => write!(f, "horizontal"),
            FlipDirection::Vertical => write!(f, "vertical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgNormCfg {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub to_rgb: bool,
}

/// The record a pipeline mutates step by step.
///
/// Images are `[H, W, C]` in BGR order; label maps are `[H, W]`. Shapes are
/// kept as `[H, W, C]` vectors and always describe the current image.
#[derive(Debug, Clone, Default)]
pub struct SegResults {
    pub img_prefix: Option<PathBuf>,
    /// Image file name relative to `img_prefix`.
    pub img_file: Option<String>,
    pub seg_prefix: Option<PathBuf>,
    /// Label file name relative to `seg_prefix`.
    pub seg_map: Option<String>,

    pub filename: Option<PathBuf>,
    pub ori_filename: Option<String>,
    pub img: Option<Tensor<f32>>,
    pub seg_fields: BTreeMap<String, Tensor<u8>>,

    pub ori_shape: Vec<usize>,
    pub img_shape: Vec<usize>,
    pub pad_shape: Vec<usize>,
    /// `[w, h, w, h]` ratios of the current size to the loaded size.
    pub scale_factor: [f32; 4],
    pub keep_ratio: Option<bool>,
    /// Target scale picked by `Resize`, as configured (`(long, short)` or `(w, h)`).
    pub scale: Option<(usize, usize)>,
    pub flip: Option<bool>,
    pub flip_direction: Option<FlipDirection>,
    pub img_norm_cfg: Option<ImgNormCfg>,
    pub pad_fixed_size: Option<(usize, usize)>,
    pub pad_size_divisor: Option<usize>,
}

impl SegResults {
    /// Record pointing at files still to be loaded.
    pub fn from_files(
        img_prefix: impl Into<PathBuf>,
        img_file: &str,
        seg_prefix: Option<PathBuf>,
        seg_map: Option<&str>,
    ) -> Self {
        SegResults {
            img_prefix: Some(img_prefix.into()),
            img_file: Some(img_file.to_string()),
            seg_prefix,
            seg_map: seg_map.map(str::to_string),
            ..SegResults::default()
        }
    }

    /// Record around an already decoded `[H, W, C]` image.
    pub fn from_image(img: Tensor<f32>) -> Self {
        let mut results = SegResults::default();
        results.set_loaded_image(img);
        results
    }

    pub fn with_seg(mut self, key: &str, seg: Tensor<u8>) -> Self {
        self.seg_fields.insert(key.to_string(), seg);
        self
    }

    pub(crate) fn set_loaded_image(&mut self, img: Tensor<f32>) {
        let shape = img.shape_vec();
        self.ori_shape = shape.clone();
        self.img_shape = shape.clone();
        self.pad_shape = shape;
        self.scale_factor = [1.0; 4];
        self.img = Some(img);
    }

    pub fn img(&self) -> TransformResult<&Tensor<f32>> {
        self.img.as_ref().ok_or(TransformError::MissingField("img"))
    }

    pub fn take_img(&mut self) -> TransformResult<Tensor<f32>> {
        self.img.take().ok_or(TransformError::MissingField("img"))
    }

    /// Store a transformed image and refresh `img_shape`.
    pub fn put_img(&mut self, img: Tensor<f32>) {
        self.img_shape = img.shape_vec();
        self.img = Some(img);
    }

    pub fn gt_semantic_seg(&self) -> Option<&Tensor<u8>> {
        self.seg_fields.get(GT_SEMANTIC_SEG)
    }

    /// Apply `f` to every label map.
    pub fn map_segs<F>(&mut self, mut f: F) -> TransformResult<()>
    where
        F: FnMut(&Tensor<u8>) -> TransformResult<Tensor<u8>>,
    {
        for seg in self.seg_fields.values_mut() {
            *seg = f(seg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_image_sets_shapes() {
        let results = SegResults::from_image(Tensor::zeros(vec![4, 6, 3]));
        assert_eq!(results.ori_shape, vec![4, 6, 3]);
        assert_eq!(results.pad_shape, vec![4, 6, 3]);
        assert_eq!(results.scale_factor, [1.0; 4]);
        assert!(results.gt_semantic_seg().is_none());
    }

    #[test]
    fn test_put_img_tracks_shape() {
        let mut results = SegResults::from_image(Tensor::zeros(vec![4, 6, 3]));
        let img = results.take_img().unwrap();
        assert!(matches!(results.img(), Err(TransformError::MissingField("img"))));
        results.put_img(img.crop_hw(0, 2, 0, 3).unwrap());
        assert_eq!(results.img_shape, vec![2, 3, 3]);
        assert_eq!(results.ori_shape, vec![4, 6, 3]);
    }
}
