//! Tiled pairwise frame interpolation on a compute backend.
//!
//! Two frames go in, are cut into overlapping tiles, normalized on the
//! device, handed to an interpolation model and stitched back into one
//! output frame. See [`pipeline::InterpolationPipeline`] for the entry point.

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod logging;
pub mod memory;
pub mod normalize;
pub mod onnx;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod runtime;
pub mod tiling;
pub mod types;

pub use device::{ComputeBackend, ElementType, HostBackend};
pub use engine::{InferenceEngine, ModelBindings};
pub use error::{ErrorClass, PipelineError, Result};
pub use layout::PixelLayout;
pub use normalize::Normalization;
pub use pipeline::{FrameReport, InterpolationPipeline, PipelineOptions, PipelineState};
pub use tiling::{TileGrid, TilePolicy, TileSpec, TilingMode};
pub use types::{Frame, Rect};
