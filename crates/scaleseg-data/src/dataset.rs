use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::StdRng;
use scaleseg_config::{params, Registry};
use scaleseg_core::Tensor;
use scaleseg_transforms::{build_pipeline, Compose, SegResults, Transform, GT_SEMANTIC_SEG};
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{DataError, DataResult};

/// Indexed source of pipeline-processed samples.
///
/// `get` takes the generator so callers decide how augmentation randomness
/// is seeded; implementations must be shareable across loader threads.
pub trait Dataset: Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get(&self, idx: usize, rng: &mut StdRng) -> DataResult<SegResults>;
}

fn check_index(index: usize, len: usize) -> DataResult<()> {
    if index >= len {
        return Err(DataError::IndexOutOfRange { index, len });
    }
    Ok(())
}

/// Decoded images and optional label maps held in memory.
#[derive(Default)]
pub struct InMemoryDataset {
    samples: Vec<(Tensor<f32>, Option<Tensor<u8>>)>,
    pipeline: Compose,
}

impl InMemoryDataset {
    pub fn new(pipeline: Compose) -> Self {
        InMemoryDataset {
            samples: Vec::new(),
            pipeline,
        }
    }

    /// Add an `[H, W, C]` image with its `[H, W]` label map.
    pub fn push(&mut self, img: Tensor<f32>, seg: Option<Tensor<u8>>) {
        self.samples.push((img, seg));
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize, rng: &mut StdRng) -> DataResult<SegResults> {
        check_index(idx, self.len())?;
        let (img, seg) = &self.samples[idx];
        let mut results = SegResults::from_image(img.clone());
        if let Some(seg) = seg {
            results = results.with_seg(GT_SEMANTIC_SEG, seg.clone());
        }
        self.pipeline.apply(&mut results, rng)?;
        Ok(results)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sample {
    img_file: String,
    seg_map: Option<String>,
}

/// Files under `dir` (recursively) ending in `suffix`, as sorted `/`-joined
/// relative paths.
///
/// Symlinks are followed; a link pointing back at one of its ancestors is
/// skipped with a warning instead of being walked again.
pub fn list_files(dir: &Path, suffix: &str) -> DataResult<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(ancestor) = err.loop_ancestor() {
                    warn!(
                        "skipping {}: symlink loop back to {}",
                        err.path().unwrap_or(dir).display(),
                        ancestor.display()
                    );
                    continue;
                }
                return Err(DataError::Walk {
                    dir: dir.to_path_buf(),
                    source: err,
                });
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            let rel: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
            let rel = rel.join("/");
            if rel.ends_with(suffix) {
                out.push(rel);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn default_img_suffix() -> String {
    ".jpg".to_string()
}

fn default_seg_map_suffix() -> String {
    ".png".to_string()
}

/// `data` section entry of an experiment config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegDatasetConfig {
    /// Prefix for relative `img_dir`/`ann_dir`.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    pub img_dir: PathBuf,
    #[serde(default)]
    pub ann_dir: Option<PathBuf>,
    #[serde(default = "default_img_suffix")]
    pub img_suffix: String,
    #[serde(default = "default_seg_map_suffix")]
    pub seg_map_suffix: String,
    #[serde(default)]
    pub pipeline: Value,
}

/// Image directory paired with an optional directory of label PNGs.
///
/// `a/b.jpg` under `img_dir` pairs with `a/b.png` under `ann_dir`.
pub struct SegDataset {
    img_dir: PathBuf,
    ann_dir: Option<PathBuf>,
    samples: Vec<Sample>,
    pipeline: Compose,
}

impl SegDataset {
    pub fn new(
        img_dir: impl Into<PathBuf>,
        ann_dir: Option<PathBuf>,
        img_suffix: &str,
        seg_map_suffix: &str,
        pipeline: Compose,
    ) -> DataResult<Self> {
        let img_dir = img_dir.into();
        let files = list_files(&img_dir, img_suffix)?;
        if files.is_empty() {
            return Err(DataError::NoSamples {
                dir: img_dir,
                suffix: img_suffix.to_string(),
            });
        }
        let samples = files
            .into_iter()
            .map(|img_file| {
                let seg_map = ann_dir.as_ref().map(|_| {
                    let stem = img_file.strip_suffix(img_suffix).unwrap_or(&img_file);
                    format!("{}{}", stem, seg_map_suffix)
                });
                Sample { img_file, seg_map }
            })
            .collect::<Vec<_>>();
        info!("loaded {} images from {}", samples.len(), img_dir.display());
        Ok(SegDataset {
            img_dir,
            ann_dir,
            samples,
            pipeline,
        })
    }

    pub fn from_config(cfg: &Value) -> DataResult<Self> {
        let config: SegDatasetConfig = params(cfg)?;
        let resolve = |p: &Path| match &config.data_root {
            Some(root) if p.is_relative() => root.join(p),
            _ => p.to_path_buf(),
        };
        let pipeline = if config.pipeline.is_null() {
            Compose::default()
        } else {
            build_pipeline(&config.pipeline)?
        };
        Self::new(
            resolve(&config.img_dir),
            config.ann_dir.as_deref().map(resolve),
            &config.img_suffix,
            &config.seg_map_suffix,
            pipeline,
        )
    }

    /// Image paths relative to `img_dir`, in sample order.
    pub fn img_files(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.img_file.as_str())
    }
}

impl Dataset for SegDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize, rng: &mut StdRng) -> DataResult<SegResults> {
        check_index(idx, self.len())?;
        let sample = &self.samples[idx];
        let mut results = SegResults::from_files(
            &self.img_dir,
            &sample.img_file,
            self.ann_dir.clone(),
            sample.seg_map.as_deref(),
        );
        self.pipeline.apply(&mut results, rng)?;
        Ok(results)
    }
}

pub type DatasetRegistry = Registry<Box<dyn Dataset>, DataError>;

pub fn datasets() -> DataResult<DatasetRegistry> {
    let mut reg = DatasetRegistry::new("dataset");
    reg.register("CustomDataset", |cfg| Ok(Box::new(SegDataset::from_config(cfg)?) as Box<dyn Dataset>))?;
    Ok(reg)
}

pub fn build_dataset(cfg: &Value) -> DataResult<Box<dyn Dataset>> {
    datasets()?.build(cfg)
}
