pub mod tensor;
pub mod shape;
pub mod dtype;
pub mod error;
pub mod resample;

pub use tensor::Tensor;
pub use shape::Shape;
pub use dtype::{Element, Float};
pub use error::{TensorError, TensorResult};
