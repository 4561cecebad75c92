//! Spatial steps: resize, crop, pad, rotate and label rescale.

use std::fmt;

use log::trace;
use rand::rngs::StdRng;
use rand::Rng;
use scaleseg_config::params;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{bad_input, invalid, TransformResult};
use crate::results::SegResults;
use crate::transform::Transform;
use crate::warp::{dims, resize_bilinear, resize_nearest, warp_bilinear, warp_nearest, Affine};

fn default_true() -> bool {
    true
}

fn default_seg_pad_val() -> u8 {
    255
}

// ─── Resize ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiscaleMode {
    /// Long and short edges sampled independently between the configured extremes.
    #[default]
    Range,
    /// One of the configured scales.
    Value,
}

impl fmt::Display for MultiscaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultiscaleMode::Range => write!(f, "range"),
            MultiscaleMode::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScaleSpec {
    One((usize, usize)),
    Many(Vec<(usize, usize)>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResizeParams {
    #[serde(default)]
    img_scale: Option<ScaleSpec>,
    #[serde(default)]
    multiscale_mode: MultiscaleMode,
    #[serde(default)]
    ratio_range: Option<(f64, f64)>,
    #[serde(default = "default_true")]
    keep_ratio: bool,
}

/// Resize the image and label maps to a scale picked from the configuration.
///
/// With `keep_ratio` the scale `(a, b)` bounds the long edge by `max(a, b)`
/// and the short edge by `min(a, b)`; otherwise it is an exact `(w, h)`.
#[derive(Debug, Clone)]
pub struct Resize {
    img_scale: Vec<(usize, usize)>,
    multiscale_mode: MultiscaleMode,
    ratio_range: Option<(f64, f64)>,
    keep_ratio: bool,
}

impl Resize {
    const NAME: &'static str = "Resize";

    pub fn new(
        img_scale: Vec<(usize, usize)>,
        multiscale_mode: MultiscaleMode,
        ratio_range: Option<(f64, f64)>,
        keep_ratio: bool,
    ) -> TransformResult<Self> {
        match ratio_range {
            Some((lo, hi)) => {
                if img_scale.len() > 1 {
                    return Err(invalid(Self::NAME, "ratio_range takes at most one img_scale"));
                }
                if !(lo > 0.0 && lo <= hi) {
                    return Err(invalid(Self::NAME, format!("bad ratio_range ({}, {})", lo, hi)));
                }
            }
            None if img_scale.is_empty() => {
                return Err(invalid(Self::NAME, "img_scale is required without ratio_range"));
            }
            None if img_scale.len() > 1 && multiscale_mode == MultiscaleMode::Range && img_scale.len() != 2 => {
                return Err(invalid(Self::NAME, "range mode needs exactly two scales"));
            }
            None => {}
        }
        if img_scale.iter().any(|&(a, b)| a == 0 || b == 0) {
            return Err(invalid(Self::NAME, "scales must be positive"));
        }
        Ok(Resize {
            img_scale,
            multiscale_mode,
            ratio_range,
            keep_ratio,
        })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: ResizeParams = params(cfg)?;
        let img_scale = match p.img_scale {
            None => Vec::new(),
            Some(ScaleSpec::One(s)) => vec![s],
            Some(ScaleSpec::Many(v)) => v,
        };
        Self::new(img_scale, p.multiscale_mode, p.ratio_range, p.keep_ratio)
    }

    /// Pick a target scale for an `h × w` image.
    pub fn random_scale(&self, h: usize, w: usize, rng: &mut StdRng) -> (usize, usize) {
        if let Some((lo, hi)) = self.ratio_range {
            let (a, b) = self.img_scale.first().copied().unwrap_or((w, h));
            let ratio = lo + (hi - lo) * rng.gen::<f64>();
            return ((a as f64 * ratio) as usize, (b as f64 * ratio) as usize);
        }
        if self.img_scale.len() == 1 {
            return self.img_scale[0];
        }
        match self.multiscale_mode {
            MultiscaleMode::Range => {
                let longs = self.img_scale.iter().map(|&(a, b)| a.max(b));
                let shorts = self.img_scale.iter().map(|&(a, b)| a.min(b));
                let (long_lo, long_hi) = (longs.clone().min().unwrap_or(0), longs.max().unwrap_or(0));
                let (short_lo, short_hi) = (shorts.clone().min().unwrap_or(0), shorts.max().unwrap_or(0));
                (rng.gen_range(long_lo..=long_hi), rng.gen_range(short_lo..=short_hi))
            }
            MultiscaleMode::Value => self.img_scale[rng.gen_range(0..self.img_scale.len())],
        }
    }
}

/// Output `(h, w)` when fitting `h × w` inside `scale` while keeping the ratio.
pub fn rescale_size(h: usize, w: usize, scale: (usize, usize)) -> (usize, usize) {
    let long = scale.0.max(scale.1) as f64;
    let short = scale.0.min(scale.1) as f64;
    let factor = (long / h.max(w) as f64).min(short / h.min(w) as f64);
    ((h as f64 * factor + 0.5) as usize, (w as f64 * factor + 0.5) as usize)
}

impl Transform for Resize {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()> {
        let (h, w, _) = dims(results.img()?)?;
        let scale = match results.scale {
            Some(s) => s,
            None => {
                let s = self.random_scale(h, w, rng);
                results.scale = Some(s);
                s
            }
        };
        let (new_h, new_w) = if self.keep_ratio {
            rescale_size(h, w, scale)
        } else {
            (scale.1, scale.0)
        };
        if new_h == 0 || new_w == 0 {
            return Err(bad_input(Self::NAME, format!("scale {:?} collapses a {}x{} image", scale, h, w)));
        }
        trace!("resize {}x{} -> {}x{}", h, w, new_h, new_w);

        let img = resize_bilinear(results.img()?, new_h, new_w)?;
        results.put_img(img);
        results.pad_shape = results.img_shape.clone();
        let (sw, sh) = (new_w as f32 / w as f32, new_h as f32 / h as f32);
        results.scale_factor = [sw, sh, sw, sh];
        results.keep_ratio = Some(self.keep_ratio);
        results.map_segs(|seg| Ok(resize_nearest(seg, new_h, new_w)?))
    }
}

impl fmt::Display for Resize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resize(img_scale={:?}, multiscale_mode={}, ", self.img_scale, self.multiscale_mode)?;
        match self.ratio_range {
            Some((lo, hi)) => write!(f, "ratio_range=({:?}, {:?}), ", lo, hi)?,
            None => write!(f, "ratio_range=None, ")?,
        }
        write!(f, "keep_ratio={})", self.keep_ratio)
    }
}

// ─── RandomCrop ─────────────────────────────────────────────────────────────

fn default_cat_max_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomCropParams {
    crop_size: (i64, i64),
    #[serde(default = "default_cat_max_ratio")]
    cat_max_ratio: f64,
    #[serde(default = "default_seg_pad_val")]
    ignore_index: u8,
}

/// Crop a random `crop_size = (h, w)` window; maps smaller than the window
/// are kept whole along that axis.
#[derive(Debug, Clone)]
pub struct RandomCrop {
    crop_size: (usize, usize),
    cat_max_ratio: f64,
    ignore_index: u8,
}

type Bbox = (usize, usize, usize, usize);

impl RandomCrop {
    const NAME: &'static str = "RandomCrop";
    const MAX_RETRIES: usize = 10;

    pub fn new(crop_size: (i64, i64), cat_max_ratio: f64, ignore_index: u8) -> TransformResult<Self> {
        if crop_size.0 <= 0 || crop_size.1 <= 0 {
            return Err(invalid(Self::NAME, format!("crop_size {:?} must be positive", crop_size)));
        }
        if !(cat_max_ratio > 0.0 && cat_max_ratio <= 1.0) {
            return Err(invalid(Self::NAME, format!("cat_max_ratio {} not in (0, 1]", cat_max_ratio)));
        }
        Ok(RandomCrop {
            crop_size: (crop_size.0 as usize, crop_size.1 as usize),
            cat_max_ratio,
            ignore_index,
        })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: RandomCropParams = params(cfg)?;
        Self::new(p.crop_size, p.cat_max_ratio, p.ignore_index)
    }

    fn crop_bbox(&self, h: usize, w: usize, rng: &mut StdRng) -> Bbox {
        let margin_h = h.saturating_sub(self.crop_size.0);
        let margin_w = w.saturating_sub(self.crop_size.1);
        let y = rng.gen_range(0..=margin_h);
        let x = rng.gen_range(0..=margin_w);
        (y, y + self.crop_size.0, x, x + self.crop_size.1)
    }

    /// At least two labeled classes and none above `cat_max_ratio`.
    fn balanced(&self, seg: &[u8]) -> bool {
        let mut counts = [0usize; 256];
        for &v in seg {
            counts[v as usize] += 1;
        }
        counts[self.ignore_index as usize] = 0;
        let present: Vec<usize> = counts.iter().copied().filter(|&c| c > 0).collect();
        let total: usize = present.iter().sum();
        let max = present.iter().copied().max().unwrap_or(0);
        present.len() > 1 && (max as f64) / (total as f64) < self.cat_max_ratio
    }
}

impl Transform for RandomCrop {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()> {
        let (h, w, _) = dims(results.img()?)?;
        let mut bbox = self.crop_bbox(h, w, rng);
        if self.cat_max_ratio < 1.0 {
            if let Some(seg) = results.gt_semantic_seg() {
                for _ in 0..Self::MAX_RETRIES {
                    let (y1, y2, x1, x2) = bbox;
                    if self.balanced(seg.crop_hw(y1, y2, x1, x2)?.data()) {
                        break;
                    }
                    bbox = self.crop_bbox(h, w, rng);
                }
            }
        }

        let (y1, y2, x1, x2) = bbox;
        let img = results.img()?.crop_hw(y1, y2, x1, x2)?;
        results.put_img(img);
        results.map_segs(|seg| Ok(seg.crop_hw(y1, y2, x1, x2)?))
    }
}

impl fmt::Display for RandomCrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RandomCrop(crop_size=({}, {}), cat_max_ratio={:?}, ignore_index={})",
            self.crop_size.0, self.crop_size.1, self.cat_max_ratio, self.ignore_index
        )
    }
}

// ─── Pad ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PadParams {
    #[serde(default)]
    size: Option<(usize, usize)>,
    #[serde(default)]
    size_divisor: Option<usize>,
    #[serde(default)]
    pad_val: f32,
    #[serde(default = "default_seg_pad_val")]
    seg_pad_val: u8,
}

/// Pad at the bottom and right, either to a fixed `(h, w)` or up to the
/// next multiple of `size_divisor`.
#[derive(Debug, Clone)]
pub struct Pad {
    size: Option<(usize, usize)>,
    size_divisor: Option<usize>,
    pad_val: f32,
    seg_pad_val: u8,
}

impl Pad {
    const NAME: &'static str = "Pad";

    pub fn new(
        size: Option<(usize, usize)>,
        size_divisor: Option<usize>,
        pad_val: f32,
        seg_pad_val: u8,
    ) -> TransformResult<Self> {
        match (size, size_divisor) {
            (None, None) => return Err(invalid(Self::NAME, "one of size or size_divisor is required")),
            (Some(_), Some(_)) => return Err(invalid(Self::NAME, "size and size_divisor are exclusive")),
            (Some((h, w)), None) if h == 0 || w == 0 => {
                return Err(invalid(Self::NAME, "size must be positive"))
            }
            (None, Some(0)) => return Err(invalid(Self::NAME, "size_divisor must be positive")),
            _ => {}
        }
        Ok(Pad {
            size,
            size_divisor,
            pad_val,
            seg_pad_val,
        })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: PadParams = params(cfg)?;
        Self::new(p.size, p.size_divisor, p.pad_val, p.seg_pad_val)
    }

    fn target(&self, h: usize, w: usize) -> (usize, usize) {
        match (self.size, self.size_divisor) {
            (Some(size), _) => size,
            (None, Some(d)) => (h.div_ceil(d) * d, w.div_ceil(d) * d),
            (None, None) => (h, w),
        }
    }
}

impl Transform for Pad {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        let (h, w, _) = dims(results.img()?)?;
        let (out_h, out_w) = self.target(h, w);
        let img = results.img()?.pad_hw(out_h, out_w, self.pad_val)?;
        results.put_img(img);
        results.pad_shape = results.img_shape.clone();
        results.pad_fixed_size = self.size;
        results.pad_size_divisor = self.size_divisor;
        let seg_pad_val = self.seg_pad_val;
        results.map_segs(|seg| Ok(seg.pad_hw(out_h, out_w, seg_pad_val)?))
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pad(")?;
        match self.size {
            Some((h, w)) => write!(f, "size=({}, {}), ", h, w)?,
            None => write!(f, "size=None, ")?,
        }
        match self.size_divisor {
            Some(d) => write!(f, "size_divisor={}, ", d)?,
            None => write!(f, "size_divisor=None, ")?,
        }
        write!(f, "pad_val={}, seg_pad_val={})", self.pad_val, self.seg_pad_val)
    }
}

// ─── RandomRotate ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DegreeSpec {
    Scalar(f64),
    Range(Vec<f64>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomRotateParams {
    prob: f64,
    degree: DegreeSpec,
    #[serde(default)]
    pad_val: f32,
    #[serde(default = "default_seg_pad_val")]
    seg_pad_val: u8,
    #[serde(default)]
    center: Option<(f64, f64)>,
    #[serde(default)]
    auto_bound: bool,
}

/// Rotate by an angle drawn uniformly from `degree`; positive angles turn
/// clockwise.
///
/// The default centre is the image centre. With `auto_bound` the canvas
/// grows to hold the whole rotated image.
#[derive(Debug, Clone)]
pub struct RandomRotate {
    prob: f64,
    degree: (f64, f64),
    pad_val: f32,
    seg_pad_val: u8,
    center: Option<(f64, f64)>,
    auto_bound: bool,
}

impl RandomRotate {
    const NAME: &'static str = "RandomRotate";

    pub fn new(
        prob: f64,
        degree: (f64, f64),
        pad_val: f32,
        seg_pad_val: u8,
        center: Option<(f64, f64)>,
        auto_bound: bool,
    ) -> TransformResult<Self> {
        if !(0.0..=1.0).contains(&prob) {
            return Err(invalid(Self::NAME, format!("prob {} not in [0, 1]", prob)));
        }
        if center.is_some() && auto_bound {
            return Err(invalid(Self::NAME, "auto_bound conflicts with center"));
        }
        Ok(RandomRotate {
            prob,
            degree,
            pad_val,
            seg_pad_val,
            center,
            auto_bound,
        })
    }

    /// A scalar `d > 0` stands for `(-d, d)`; a list must have two entries.
    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: RandomRotateParams = params(cfg)?;
        let degree = match p.degree {
            DegreeSpec::Scalar(d) if d > 0.0 => (-d, d),
            DegreeSpec::Scalar(d) => {
                return Err(invalid(Self::NAME, format!("scalar degree must be positive, got {}", d)))
            }
            DegreeSpec::Range(v) if v.len() == 2 => (v[0], v[1]),
            DegreeSpec::Range(v) => {
                return Err(invalid(Self::NAME, format!("degree needs 2 values, got {}", v.len())))
            }
        };
        Self::new(p.prob, degree, p.pad_val, p.seg_pad_val, p.center, p.auto_bound)
    }
}

impl Transform for RandomRotate {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()> {
        let rotate = rng.gen::<f64>() < self.prob;
        let (lo, hi) = (self.degree.0.min(self.degree.1), self.degree.0.max(self.degree.1));
        let degree = lo + (hi - lo) * rng.gen::<f64>();
        if !rotate {
            return Ok(());
        }

        let (h, w, _) = dims(results.img()?)?;
        let center = self
            .center
            .unwrap_or(((w as f64 - 1.0) * 0.5, (h as f64 - 1.0) * 0.5));
        let mut matrix = Affine::rotation(center, -degree);
        let (mut out_h, mut out_w) = (h, w);
        if self.auto_bound {
            let (cos, sin) = (matrix.0[0].abs(), matrix.0[1].abs());
            let new_w = w as f64 * cos + h as f64 * sin;
            let new_h = h as f64 * cos + w as f64 * sin;
            matrix = matrix.translate((new_w - w as f64) * 0.5, (new_h - h as f64) * 0.5);
            out_w = new_w.round() as usize;
            out_h = new_h.round() as usize;
        }
        trace!("rotate by {:.2} degrees into {}x{}", degree, out_h, out_w);
        let to_src = matrix.inverse()?;

        let img = warp_bilinear(results.img()?, &to_src, out_h, out_w, self.pad_val)?;
        results.put_img(img);
        let seg_pad_val = self.seg_pad_val;
        results.map_segs(|seg| Ok(warp_nearest(seg, &to_src, out_h, out_w, seg_pad_val)?))
    }
}

impl fmt::Display for RandomRotate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RandomRotate(prob={:?}, degree=({:?}, {:?}), pad_val={}, seg_pad_val={}, ",
            self.prob, self.degree.0, self.degree.1, self.pad_val, self.seg_pad_val
        )?;
        match self.center {
            Some((x, y)) => write!(f, "center=({:?}, {:?}), ", x, y)?,
            None => write!(f, "center=None, ")?,
        }
        write!(f, "auto_bound={})", self.auto_bound)
    }
}

// ─── SegRescale ─────────────────────────────────────────────────────────────

fn default_scale_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegRescaleParams {
    #[serde(default = "default_scale_factor")]
    scale_factor: f64,
}

/// Rescale label maps only, with nearest sampling to `floor(shape * factor)`.
#[derive(Debug, Clone)]
pub struct SegRescale {
    scale_factor: f64,
}

impl SegRescale {
    const NAME: &'static str = "SegRescale";

    pub fn new(scale_factor: f64) -> TransformResult<Self> {
        if scale_factor <= 0.0 || !scale_factor.is_finite() {
            return Err(invalid(Self::NAME, format!("scale_factor {} must be positive", scale_factor)));
        }
        Ok(SegRescale { scale_factor })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: SegRescaleParams = params(cfg)?;
        Self::new(p.scale_factor)
    }
}

impl Transform for SegRescale {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        if self.scale_factor == 1.0 {
            return Ok(());
        }
        let s = self.scale_factor;
        results.map_segs(|seg| {
            let (h, w, _) = dims(seg)?;
            let (new_h, new_w) = ((h as f64 * s).floor() as usize, (w as f64 * s).floor() as usize);
            if new_h == 0 || new_w == 0 {
                return Err(bad_input(Self::NAME, format!("{}x{} label map vanishes at {}", h, w, s)));
            }
            Ok(resize_nearest(seg, new_h, new_w)?)
        })
    }
}

impl fmt::Display for SegRescale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegRescale(scale_factor={:?})", self.scale_factor)
    }
}
