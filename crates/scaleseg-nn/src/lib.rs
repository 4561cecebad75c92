pub mod module;
pub mod conv;
pub mod norm;
pub mod pool;
pub mod resample;

pub use module::{join, load_state_dict, save_state_dict, LoadReport, Module, ReLU, Sequential, StateDict};
pub use conv::{Conv2D, Conv2DConfig, ConvBN};
pub use norm::BatchNorm2D;
pub use pool::MaxPool2D;
pub use resample::{interpolate, Interpolation};
