use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use scaleseg_core::{Element, Tensor};
use scaleseg_transforms::{SegResults, GT_SEMANTIC_SEG};

use crate::dataset::Dataset;
use crate::error::{DataError, DataResult};

/// One collated mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[N, C, H, W]`.
    pub img: Tensor<f32>,
    /// `[N, H, W]`; present when every sample has a label map.
    pub gt_semantic_seg: Option<Tensor<u8>>,
    /// Per-sample records with the arrays moved out.
    pub metas: Vec<SegResults>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for the augmentation generator of sample `index` in `epoch`.
pub fn sample_seed(seed: u64, epoch: u64, index: u64) -> u64 {
    splitmix64(splitmix64(splitmix64(seed) ^ epoch) ^ index)
}

/// Stack processed samples into a [`Batch`].
pub fn collate(samples: Vec<SegResults>) -> DataResult<Batch> {
    let mut imgs = Vec::with_capacity(samples.len());
    let mut segs = Vec::with_capacity(samples.len());
    let mut metas = Vec::with_capacity(samples.len());
    for (index, mut sample) in samples.into_iter().enumerate() {
        let img = sample.take_img()?.hwc_to_chw()?;
        if let Some(first) = imgs.first() {
            check_same(index, "img", first, &img)?;
        }
        imgs.push(img);
        if let Some(seg) = sample.seg_fields.remove(GT_SEMANTIC_SEG) {
            if let Some(first) = segs.first() {
                check_same(index, "gt_semantic_seg", first, &seg)?;
            }
            segs.push(seg);
        }
        if !segs.is_empty() && segs.len() != imgs.len() {
            // some samples of the batch are unlabeled
            return Err(DataError::BatchMismatch {
                index,
                what: "gt_semantic_seg",
                expected: segs[0].shape_vec(),
                got: Vec::new(),
            });
        }
        metas.push(sample);
    }

    let img = Tensor::stack(&imgs.iter().collect::<Vec<_>>())?;
    let gt_semantic_seg = if segs.is_empty() {
        None
    } else {
        Some(Tensor::stack(&segs.iter().collect::<Vec<_>>())?)
    };
    Ok(Batch {
        img,
        gt_semantic_seg,
        metas,
    })
}

fn check_same<T: Element>(
    index: usize,
    what: &'static str,
    first: &Tensor<T>,
    t: &Tensor<T>,
) -> DataResult<()> {
    if first.shape() != t.shape() {
        return Err(DataError::BatchMismatch {
            index,
            what,
            expected: first.shape_vec(),
            got: t.shape_vec(),
        });
    }
    Ok(())
}

/// Batches a [`Dataset`], running the samples of each batch in parallel.
///
/// Sample order and every sample's augmentation depend only on
/// `(seed, epoch, index)`, so runs are reproducible regardless of how rayon
/// schedules the work.
pub struct DataLoader<'a, D: Dataset + ?Sized> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: u64,
    indices: Vec<usize>,
    current: usize,
}

impl<'a, D: Dataset + ?Sized> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize, shuffle: bool, seed: u64) -> DataResult<Self> {
        if batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be positive".into()));
        }
        let mut loader = DataLoader {
            dataset,
            batch_size,
            shuffle,
            drop_last: false,
            seed,
            epoch: 0,
            indices: Vec::new(),
            current: 0,
        };
        loader.set_epoch(0);
        Ok(loader)
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Start `epoch` from its first batch, reshuffling when enabled.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.current = 0;
        self.indices = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(sample_seed(self.seed, epoch, u64::MAX));
            self.indices.shuffle(&mut rng);
        }
    }

    /// Rewind the current epoch.
    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_batches(&self) -> usize {
        let n = self.indices.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }
}

impl<'a, D: Dataset + ?Sized> Iterator for DataLoader<'a, D> {
    type Item = DataResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.current);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }

        let end = self.current + remaining.min(self.batch_size);
        let batch_indices = &self.indices[self.current..end];
        self.current = end;

        let (dataset, seed, epoch) = (self.dataset, self.seed, self.epoch);
        debug!("epoch {} batch of {} samples", epoch, batch_indices.len());
        let samples: DataResult<Vec<SegResults>> = batch_indices
            .par_iter()
            .map(|&idx| {
                let mut rng = StdRng::seed_from_u64(sample_seed(seed, epoch, idx as u64));
                dataset.get(idx, &mut rng)
            })
            .collect();
        Some(samples.and_then(collate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemoryDataset;
    use scaleseg_transforms::build_pipeline;
    use serde_json::json;

    fn dataset(pipeline: serde_json::Value, n: usize) -> InMemoryDataset {
        let mut ds = InMemoryDataset::new(build_pipeline(&pipeline).unwrap());
        for i in 0..n {
            let img = Tensor::new((0..4 * 6 * 3).map(|v| (v + i) as f32).collect(), vec![4, 6, 3]).unwrap();
            let seg = Tensor::new((0..4 * 6).map(|v| (v % 3) as u8).collect(), vec![4, 6]).unwrap();
            ds.push(img, Some(seg));
        }
        ds
    }

    #[test]
    fn test_batches_are_collated_nchw() {
        let ds = dataset(json!([]), 5);
        let mut loader = DataLoader::new(&ds, 2, false, 0).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batch = loader.next().unwrap().unwrap();
        assert_eq!(batch.img.shape_vec(), vec![2, 3, 4, 6]);
        assert_eq!(batch.gt_semantic_seg.as_ref().unwrap().shape_vec(), vec![2, 4, 6]);
        assert_eq!(batch.len(), 2);
        // channel 1 of pixel (0, 0) of the first sample
        assert_eq!(batch.img.get(&[0, 1, 0, 0]).unwrap(), 1.0);
        assert!(batch.metas[0].img.is_none());

        let sizes: Vec<usize> = loader.map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_drop_last() {
        let ds = dataset(json!([]), 5);
        let loader = DataLoader::new(&ds, 2, false, 0).unwrap().with_drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.count(), 2);
        assert!(DataLoader::new(&ds, 0, false, 0).is_err());
    }

    #[test]
    fn test_runs_are_reproducible() {
        let pipeline = json!([
            {"type": "RandomFlip", "prob": 0.5},
            {"type": "RandomCrop", "crop_size": [3, 3]}
        ]);
        let ds = dataset(pipeline, 6);
        let collect = |epoch| {
            let mut loader = DataLoader::new(&ds, 4, true, 11).unwrap();
            loader.set_epoch(epoch);
            loader.map(|b| b.unwrap().img.into_data()).collect::<Vec<_>>()
        };
        assert_eq!(collect(0), collect(0));
        assert_ne!(collect(0), collect(1));
    }

    #[test]
    fn test_shuffle_covers_every_sample() {
        let ds = dataset(json!([]), 7);
        let mut loader = DataLoader::new(&ds, 3, true, 5).unwrap();
        loader.set_epoch(2);
        let mut firsts: Vec<f32> = Vec::new();
        for batch in loader {
            let batch = batch.unwrap();
            for i in 0..batch.len() {
                firsts.push(batch.img.get(&[i, 0, 0, 0]).unwrap());
            }
        }
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(firsts, (0..7).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let mut ds = InMemoryDataset::default();
        ds.push(Tensor::zeros(vec![4, 4, 3]), None);
        ds.push(Tensor::zeros(vec![4, 5, 3]), None);
        let mut loader = DataLoader::new(&ds, 2, false, 0).unwrap();
        assert!(matches!(
            loader.next(),
            Some(Err(DataError::BatchMismatch { index: 1, what: "img", .. }))
        ));

        let mut ds = InMemoryDataset::default();
        ds.push(Tensor::zeros(vec![4, 4, 3]), Some(Tensor::zeros(vec![4, 4])));
        ds.push(Tensor::zeros(vec![4, 4, 3]), None);
        let mut loader = DataLoader::new(&ds, 2, false, 0).unwrap();
        assert!(matches!(loader.next(), Some(Err(DataError::BatchMismatch { .. }))));
    }

    #[test]
    fn test_sample_seed_spreads() {
        assert_ne!(sample_seed(0, 0, 0), sample_seed(0, 0, 1));
        assert_ne!(sample_seed(0, 0, 1), sample_seed(0, 1, 0));
        assert_eq!(sample_seed(3, 4, 5), sample_seed(3, 4, 5));
    }
}
