//! Loading steps that turn file references into arrays.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::{ColorType, DynamicImage};
use log::debug;
use rand::rngs::StdRng;
use scaleseg_config::params;
use scaleseg_core::Tensor;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{bad_input, TransformError, TransformResult};
use crate::results::{SegResults, GT_SEMANTIC_SEG};
use crate::transform::Transform;

fn join(prefix: Option<&Path>, name: &str) -> PathBuf {
    match prefix {
        Some(p) => p.join(name),
        None => PathBuf::from(name),
    }
}

fn open(path: &Path) -> TransformResult<DynamicImage> {
    image::open(path).map_err(|source| TransformError::Image {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Three channels, BGR.
    #[default]
    Color,
    /// One luma channel.
    Grayscale,
    /// The file's own channel count; colour channels in BGR(A) order.
    Unchanged,
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::Color => write!(f, "color"),
            ColorMode::Grayscale => write!(f, "grayscale"),
            ColorMode::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Decode to an `[H, W, C]` array of raw 0..=255 values.
pub fn decode(img: &DynamicImage, mode: ColorMode) -> TransformResult<Tensor<f32>> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let (raw, c) = match mode {
        ColorMode::Color => (img.to_rgb8().into_raw(), 3),
        ColorMode::Grayscale => (img.to_luma8().into_raw(), 1),
        ColorMode::Unchanged => match img.color().channel_count() {
            1 => (img.to_luma8().into_raw(), 1),
            2 => (img.to_luma_alpha8().into_raw(), 2),
            3 => (img.to_rgb8().into_raw(), 3),
            _ => (img.to_rgba8().into_raw(), 4),
        },
    };
    let mut data: Vec<f32> = raw.into_iter().map(f32::from).collect();
    if c >= 3 {
        for px in data.chunks_exact_mut(c) {
            px.swap(0, 2);
        }
    }
    Ok(Tensor::new(data, vec![h, w, c])?)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadImageParams {
    #[serde(default)]
    to_float32: bool,
    #[serde(default)]
    color_type: ColorMode,
}

/// Read `img_prefix / img_file` and start the record's shape bookkeeping.
///
/// Pixels are always held as `f32`; `to_float32` is kept so configs
/// round-trip.
#[derive(Debug, Clone, Default)]
pub struct LoadImageFromFile {
    to_float32: bool,
    color_type: ColorMode,
}

impl LoadImageFromFile {
    pub fn new(to_float32: bool, color_type: ColorMode) -> Self {
        LoadImageFromFile { to_float32, color_type }
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: LoadImageParams = params(cfg)?;
        Ok(Self::new(p.to_float32, p.color_type))
    }
}

impl Transform for LoadImageFromFile {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        let name = results.img_file.clone().ok_or(TransformError::MissingField("img_file"))?;
        let path = join(results.img_prefix.as_deref(), &name);
        let img = decode(&open(&path)?, self.color_type)?;
        debug!("loaded {} as {}", path.display(), img.shape());
        results.filename = Some(path);
        results.ori_filename = Some(name);
        results.set_loaded_image(img);
        Ok(())
    }
}

impl fmt::Display for LoadImageFromFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoadImageFromFile(to_float32={}, color_type={})",
            self.to_float32, self.color_type
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadAnnotationsParams {
    #[serde(default)]
    reduce_zero_label: bool,
}

/// Read the label map at `seg_prefix / seg_map` into `gt_semantic_seg`.
///
/// Palette PNGs yield their raw palette indices, not the colours they map
/// to. Other files must be 8-bit single channel.
///
/// With `reduce_zero_label` class 0 becomes the ignore value 255 and every
/// other class shifts down by one.
#[derive(Debug, Clone, Default)]
pub struct LoadAnnotations {
    reduce_zero_label: bool,
}

impl LoadAnnotations {
    const NAME: &'static str = "LoadAnnotations";

    pub fn new(reduce_zero_label: bool) -> Self {
        LoadAnnotations { reduce_zero_label }
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: LoadAnnotationsParams = params(cfg)?;
        Ok(Self::new(p.reduce_zero_label))
    }

    fn read_labels(path: &Path) -> TransformResult<(usize, usize, Vec<u8>)> {
        let is_png = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("png"));
        if is_png {
            return read_label_png(path);
        }
        let img = open(path)?;
        if img.color() != ColorType::L8 {
            return Err(bad_input(
                Self::NAME,
                format!("{} is {:?}, label maps must be 8-bit single channel", path.display(), img.color()),
            ));
        }
        let (w, h) = (img.width() as usize, img.height() as usize);
        Ok((h, w, img.into_luma8().into_raw()))
    }
}

/// Decode a label PNG without palette expansion.
fn read_label_png(path: &Path) -> TransformResult<(usize, usize, Vec<u8>)> {
    let png_err = |source: png::DecodingError| TransformError::Png {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|e| png_err(e.into()))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(png_err)?;

    let (color, depth) = {
        let info = reader.info();
        (info.color_type, info.bit_depth)
    };
    let bits = match (color, depth) {
        (png::ColorType::Indexed, d) => d as usize,
        (png::ColorType::Grayscale, png::BitDepth::Eight) => 8,
        _ => {
            return Err(bad_input(
                LoadAnnotations::NAME,
                format!(
                    "{} is {:?} at {:?}, label maps must be palette or 8-bit grayscale",
                    path.display(),
                    color,
                    depth
                ),
            ))
        }
    };

    let size = reader
        .output_buffer_size()
        .ok_or_else(|| bad_input(LoadAnnotations::NAME, format!("{} is too large", path.display())))?;
    let mut buf = vec![0u8; size];
    let frame = reader.next_frame(&mut buf).map_err(png_err)?;
    let (w, h) = (frame.width as usize, frame.height as usize);
    debug!("label {} is {:?} {}-bit, {}x{}", path.display(), color, bits, w, h);
    Ok((h, w, unpack_rows(&buf, frame.line_size, w, h, bits)))
}

/// Unpack MSB-first `bits`-wide samples, one scan line at a time.
fn unpack_rows(buf: &[u8], line_size: usize, w: usize, h: usize, bits: usize) -> Vec<u8> {
    if bits == 8 {
        return buf.chunks(line_size).take(h).flat_map(|row| row[..w].iter().copied()).collect();
    }
    let per_byte = 8 / bits;
    let mask = (1u8 << bits) - 1;
    let mut out = Vec::with_capacity(w * h);
    for row in buf.chunks(line_size).take(h) {
        for x in 0..w {
            let shift = 8 - bits * (x % per_byte + 1);
            out.push((row[x / per_byte] >> shift) & mask);
        }
    }
    out
}

impl Transform for LoadAnnotations {
    fn apply(&self, results: &mut SegResults, _rng: &mut StdRng) -> TransformResult<()> {
        let name = results.seg_map.as_deref().ok_or(TransformError::MissingField("seg_map"))?;
        let path = join(results.seg_prefix.as_deref(), name);
        let (h, w, mut data) = Self::read_labels(&path)?;
        if self.reduce_zero_label {
            for v in data.iter_mut() {
                *v = match *v {
                    0 => 255,
                    255 => 255,
                    x => x - 1,
                };
            }
        }
        results.seg_fields.insert(GT_SEMANTIC_SEG.to_string(), Tensor::new(data, vec![h, w])?);
        Ok(())
    }
}

impl fmt::Display for LoadAnnotations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadAnnotations(reduce_zero_label={})", self.reduce_zero_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};
    use rand::SeedableRng;
    use serde_json::json;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("scaleseg-io-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn test_load_color_image_as_bgr() {
        let dir = scratch("color");
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(1, 0, image::Rgb([200, 100, 50]));
        img.save(dir.join("a.png")).unwrap();

        let mut results = SegResults::from_files(&dir, "a.png", None, None);
        LoadImageFromFile::default().apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.ori_shape, vec![2, 4, 3]);
        assert_eq!(results.pad_shape, vec![2, 4, 3]);
        assert_eq!(results.ori_filename.as_deref(), Some("a.png"));
        let loaded = results.img().unwrap();
        assert_eq!(loaded.get(&[0, 1, 0]).unwrap(), 50.0);
        assert_eq!(loaded.get(&[0, 1, 2]).unwrap(), 200.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_load_grayscale_and_unchanged() {
        let dir = scratch("gray");
        GrayImage::from_raw(3, 2, vec![0, 10, 20, 30, 40, 50]).unwrap().save(dir.join("g.png")).unwrap();

        let gray = LoadImageFromFile::from_config(&json!({"color_type": "grayscale"})).unwrap();
        let mut results = SegResults::from_files(&dir, "g.png", None, None);
        gray.apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.img_shape, vec![2, 3, 1]);

        let unchanged = LoadImageFromFile::new(true, ColorMode::Unchanged);
        assert_eq!(unchanged.to_string(), "LoadImageFromFile(to_float32=true, color_type=unchanged)");
        let mut results = SegResults::from_files(&dir, "g.png", None, None);
        unchanged.apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.img().unwrap().data(), &[0.0, 10.0, 20.0, 30.0, 40.0, 50.0]);

        let color = LoadImageFromFile::default();
        let mut results = SegResults::from_files(&dir, "g.png", None, None);
        color.apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.img_shape, vec![2, 3, 3]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_file_is_an_image_error() {
        let mut results = SegResults::from_files(scratch("missing"), "nope.png", None, None);
        assert!(matches!(
            LoadImageFromFile::default().apply(&mut results, &mut rng()),
            Err(TransformError::Image { .. })
        ));
        let mut results = SegResults::default();
        assert!(matches!(
            LoadImageFromFile::default().apply(&mut results, &mut rng()),
            Err(TransformError::MissingField("img_file"))
        ));
    }

    #[test]
    fn test_load_annotations_reduce_zero_label() {
        let dir = scratch("ann");
        GrayImage::from_raw(4, 1, vec![0, 1, 5, 255]).unwrap().save(dir.join("m.png")).unwrap();

        let mut results = SegResults::from_files(&dir, "x.png", Some(dir.clone()), Some("m.png"));
        LoadAnnotations::new(false).apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.gt_semantic_seg().unwrap().data(), &[0, 1, 5, 255]);

        let reduce = LoadAnnotations::from_config(&json!({"reduce_zero_label": true})).unwrap();
        reduce.apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.gt_semantic_seg().unwrap().data(), &[255, 0, 4, 255]);
        assert_eq!(results.gt_semantic_seg().unwrap().shape_vec(), vec![1, 4]);
        std::fs::remove_dir_all(dir).ok();
    }

    fn write_indexed(path: &Path, w: u32, h: u32, depth: png::BitDepth, packed: &[u8]) {
        let file = std::io::BufWriter::new(File::create(path).unwrap());
        let mut encoder = png::Encoder::new(file, w, h);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(depth);
        // VOC-style colours: index 1 is dark red, index 2 dark green.
        let mut palette = vec![0u8; 256 * 3];
        palette[3..9].copy_from_slice(&[128, 0, 0, 0, 128, 0]);
        palette[255 * 3..].copy_from_slice(&[224, 224, 192]);
        let entries = 1usize << (depth as u8);
        palette.truncate(entries.min(256) * 3);
        encoder.set_palette(palette);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(packed).unwrap();
    }

    #[test]
    fn test_palette_label_maps_keep_raw_indices() {
        let dir = scratch("palette");
        write_indexed(&dir.join("m.png"), 4, 1, png::BitDepth::Eight, &[0, 1, 2, 255]);

        let mut results = SegResults::from_files(&dir, "x.png", Some(dir.clone()), Some("m.png"));
        LoadAnnotations::default().apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.gt_semantic_seg().unwrap().data(), &[0, 1, 2, 255]);
        assert_eq!(results.gt_semantic_seg().unwrap().shape_vec(), vec![1, 4]);

        LoadAnnotations::new(true).apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.gt_semantic_seg().unwrap().data(), &[255, 0, 1, 255]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_low_bit_depth_palette_rows_are_unpacked() {
        let dir = scratch("palette2");
        // 3x2 at 2 bits per index; each row is padded to a whole byte.
        write_indexed(&dir.join("m.png"), 3, 2, png::BitDepth::Two, &[0b00_01_10_00, 0b10_10_01_00]);

        let mut results = SegResults::from_files(&dir, "x.png", Some(dir.clone()), Some("m.png"));
        LoadAnnotations::default().apply(&mut results, &mut rng()).unwrap();
        assert_eq!(results.gt_semantic_seg().unwrap().data(), &[0, 1, 2, 2, 2, 1]);
        assert_eq!(results.gt_semantic_seg().unwrap().shape_vec(), vec![2, 3]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_corrupt_label_png_is_a_decode_error() {
        let dir = scratch("badpng");
        std::fs::write(dir.join("m.png"), b"not a png").unwrap();
        let mut results = SegResults::from_files(&dir, "x.png", Some(dir.clone()), Some("m.png"));
        assert!(matches!(
            LoadAnnotations::default().apply(&mut results, &mut rng()),
            Err(TransformError::Png { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_colour_label_maps_are_rejected() {
        let dir = scratch("rgbann");
        RgbImage::new(2, 2).save(dir.join("m.png")).unwrap();
        let mut results = SegResults::from_files(&dir, "x.png", Some(dir.clone()), Some("m.png"));
        assert!(matches!(
            LoadAnnotations::default().apply(&mut results, &mut rng()),
            Err(TransformError::BadInput { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }
}
