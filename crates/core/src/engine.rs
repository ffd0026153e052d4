//! Inference engine boundary.
//!
//! The interpolation model is a black box with two named image inputs, an
//! optional scalar timestep input and one named output. Tiles cross this
//! boundary as `[C, H, W]` arrays in model channel order.

use std::sync::Arc;

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::device::{BufferDesc, BufferRef, CommandStream, ElementType};
use crate::error::{PipelineError, Result};
use crate::memory::{BufferLifetime, FrameScope};
use crate::tiling::TileDescriptor;

pub const DEFAULT_INPUT0: &str = "x.1";
pub const DEFAULT_INPUT1: &str = "x.3";
pub const DEFAULT_OUTPUT: &str = "4070";

/// Tensor names the model is bound through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBindings {
    pub input0: String,
    pub input1: String,
    pub output: String,
    /// Present for models that take the interpolation factor as an input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep: Option<String>,
}

impl Default for ModelBindings {
    fn default() -> Self {
        Self {
            input0: DEFAULT_INPUT0.to_string(),
            input1: DEFAULT_INPUT1.to_string(),
            output: DEFAULT_OUTPUT.to_string(),
            timestep: None,
        }
    }
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn bindings(&self) -> &ModelBindings;

    /// Interpolate between two `[3, H, W]` tiles. The result must have the
    /// same shape as the inputs. Engines without a timestep input ignore
    /// `timestep`.
    fn run(
        &self,
        input0: ArrayView3<'_, f32>,
        input1: ArrayView3<'_, f32>,
        timestep: f32,
    ) -> anyhow::Result<Array3<f32>>;
}

/// Record one engine call for `tile` and return the buffer that will hold its
/// output once the stream is submitted.
pub fn record_inference(
    stream: &mut CommandStream<'_>,
    scope: &mut FrameScope<'_>,
    engine: &Arc<dyn InferenceEngine>,
    inputs: [BufferRef; 2],
    tile: &TileDescriptor,
    timestep: f32,
    storage: ElementType,
) -> Result<BufferRef> {
    let (w, h) = (tile.padded.width(), tile.padded.height());
    for input in &inputs {
        if input.desc.width != w || input.desc.height != h {
            return Err(PipelineError::contract(format!(
                "tile ({}, {}) expects {}x{} model inputs, got {}x{}",
                tile.xi, tile.yi, w, h, input.desc.width, input.desc.height
            )));
        }
    }

    let output = scope.buffer(BufferDesc::planar(w, h, storage), BufferLifetime::Tile)?;
    stream.record_inference(Arc::clone(engine), inputs, output, timestep, (tile.xi, tile.yi))?;
    Ok(output)
}
