//! Segmentation datasets and a parallel, reproducible batch loader.

pub mod dataloader;
pub mod dataset;
pub mod error;

pub use dataloader::{collate, sample_seed, Batch, DataLoader};
pub use dataset::{build_dataset, datasets, list_files, Dataset, DatasetRegistry, InMemoryDataset, SegDataset, SegDatasetConfig};
pub use error::{DataError, DataResult};
