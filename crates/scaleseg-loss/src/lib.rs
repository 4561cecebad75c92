//! Segmentation losses: softmax cross-entropy and its partial-unlabeled
//! soft variant for weakly labeled masks.

pub mod loss;

pub use loss::{accuracy, cross_entropy, LossConfig, LossError, LossResult, PusLoss, PusType};
