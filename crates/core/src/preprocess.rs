//! Strip upload and per-tile normalization into model tensors.

use crate::device::{BufferDesc, BufferRef, CommandStream, ElementType};
use crate::error::{PipelineError, Result};
use crate::kernels::{CompiledKernel, KernelConstants, KernelKind, PreprocessConstants};
use crate::layout::CHANNELS;
use crate::memory::{BufferLifetime, FrameScope};
use crate::normalize::ColorStats;
use crate::tiling::TileDescriptor;
use crate::types::Frame;

/// Full-width band of frame rows `[y0, y1)` resident on the device.
#[derive(Debug, Clone, Copy)]
pub struct Strip {
    pub buffer: BufferRef,
    pub y0: u32,
    pub y1: u32,
}

impl Strip {
    pub fn rows(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Upload the rows one tile row reads from `frame`: the padded rows clipped
/// to the real frame height.
pub fn upload_strip(
    stream: &mut CommandStream<'_>,
    scope: &mut FrameScope<'_>,
    frame: &Frame,
    tile: &TileDescriptor,
) -> Result<Strip> {
    let y0 = tile.padded.y0;
    let y1 = tile.padded.y1.min(frame.height());
    if y0 >= y1 {
        return Err(PipelineError::contract(format!(
            "tile row {} reads no frame rows ({y0}..{y1})",
            tile.yi
        )));
    }

    let buffer = scope.buffer(BufferDesc::interleaved_u8(frame.width(), y1 - y0), BufferLifetime::Row)?;
    stream.record_upload(buffer, frame.rows(y0, y1).to_vec())?;
    Ok(Strip { buffer, y0, y1 })
}

/// Record the preprocess dispatch for `tile` and return the tensor it fills.
pub fn record_preprocess(
    stream: &mut CommandStream<'_>,
    scope: &mut FrameScope<'_>,
    kernel: &CompiledKernel,
    strip: &Strip,
    tile: &TileDescriptor,
    stats: &ColorStats,
    storage: ElementType,
) -> Result<BufferRef> {
    let key = kernel.key();
    if key.kind != KernelKind::Preprocess || key.storage != storage {
        return Err(PipelineError::contract(format!(
            "{} cannot produce {storage:?} model input",
            key.name()
        )));
    }
    if strip.y0 != tile.padded.y0 {
        return Err(PipelineError::contract(format!(
            "strip starts at row {}, tile ({}, {}) at row {}",
            strip.y0, tile.xi, tile.yi, tile.padded.y0
        )));
    }

    let (dst_w, dst_h) = (tile.padded.width(), tile.padded.height());
    let dst = scope.buffer(BufferDesc::planar(dst_w, dst_h, storage), BufferLifetime::Tile)?;
    let constants = PreprocessConstants {
        src_w: strip.buffer.desc.width,
        src_h: strip.rows(),
        src_stride: strip.buffer.desc.width * CHANNELS as u32,
        dst_w,
        dst_h,
        dst_cstep: dst_w * dst_h,
        mean: stats.mean,
        prepadding: tile.overlap,
        clamp_left: tile.clamp.left,
        xoffset: tile.core.x0,
    };
    stream.record_dispatch(
        kernel.pipeline(),
        strip.buffer,
        dst,
        KernelConstants::Preprocess(constants),
        [dst_w, dst_h, CHANNELS as u32],
    )?;
    Ok(dst)
}
