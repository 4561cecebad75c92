//! Evaluation metrics over predicted and ground-truth label maps.

pub mod segmentation;

pub use segmentation::{intersect_and_union, mean_iou, pixel_accuracy, IouAccumulator, IouReport};
