//! Segmentation models: the multi-scale `SABlock`, the `ScaleNet` backbone
//! built from a structure descriptor, an FCN decode head and the
//! encoder-decoder segmentor tying them together.

pub mod backbone;
pub mod builder;
pub mod error;
pub mod fcn_head;
pub mod sablock;
pub mod scalenet;
pub mod segmentor;
pub mod structure;

pub use backbone::{load_checkpoint, Backbone};
pub use builder::{backbones, build_backbone, build_segmentor, segmentors, BackboneRegistry, SegmentorRegistry};
pub use error::{ModelError, ModelResult};
pub use fcn_head::{FcnHead, FcnHeadConfig};
pub use sablock::{branch_pool, SABlock, EXPANSION};
pub use scalenet::{ScaleNet, ScaleNetConfig, StructureSource};
pub use segmentor::{total_loss, EncoderDecoder, Losses};
pub use structure::{BlockStructure, StructureCursor, StructureDescriptor, BRANCH_SCALES, NUM_BRANCHES};
