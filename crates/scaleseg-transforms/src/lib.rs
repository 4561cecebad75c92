//! Data augmentation for segmentation.
//!
//! A pipeline is a [`Compose`] of [`Transform`] steps, each built from a
//! `{"type": ..., ...}` config entry, that mutates a [`SegResults`] record:
//! loading, resizing, flipping, cropping, padding, rotating and normalizing
//! an image together with its label maps.

pub mod augmentation;
pub mod builder;
pub mod error;
pub mod geometric;
pub mod io;
pub mod photometric;
pub mod results;
pub mod transform;
pub mod warp;

pub use augmentation::RandomFlip;
pub use builder::{build_pipeline, pipelines, PipelineRegistry};
pub use error::{TransformError, TransformResult};
pub use geometric::{rescale_size, MultiscaleMode, Pad, RandomCrop, RandomRotate, Resize, SegRescale};
pub use io::{ColorMode, LoadAnnotations, LoadImageFromFile};
pub use photometric::{Normalize, Rgb2Gray};
pub use results::{FlipDirection, ImgNormCfg, SegResults, GT_SEMANTIC_SEG};
pub use transform::{Compose, Transform};
