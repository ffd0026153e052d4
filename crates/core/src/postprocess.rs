//! Crop model output back onto the output strip and restore the color bias.

use crate::device::{BufferDesc, BufferRef, CommandStream};
use crate::error::{PipelineError, Result};
use crate::kernels::{CompiledKernel, KernelConstants, KernelKind, PostprocessConstants};
use crate::layout::CHANNELS;
use crate::memory::{BufferLifetime, FrameScope};
use crate::normalize::ColorStats;
use crate::tiling::TileDescriptor;

/// Output rows `[y0, y1)` of one tile row, full frame width.
#[derive(Debug, Clone, Copy)]
pub struct OutputStrip {
    pub buffer: BufferRef,
    pub y0: u32,
    pub y1: u32,
}

pub fn output_strip(scope: &mut FrameScope<'_>, width: u32, tile: &TileDescriptor) -> Result<OutputStrip> {
    let (y0, y1) = (tile.core.y0, tile.core.y1);
    let buffer = scope.buffer(BufferDesc::interleaved_u8(width, y1 - y0), BufferLifetime::Row)?;
    Ok(OutputStrip { buffer, y0, y1 })
}

/// Record the postprocess dispatch writing `tile`'s core into `out`.
pub fn record_postprocess(
    stream: &mut CommandStream<'_>,
    kernel: &CompiledKernel,
    model_out: BufferRef,
    out: &OutputStrip,
    tile: &TileDescriptor,
    blend: &ColorStats,
) -> Result<()> {
    let key = kernel.key();
    if key.kind != KernelKind::Postprocess || key.storage != model_out.desc.elem {
        return Err(PipelineError::contract(format!(
            "{} cannot read {:?} model output",
            key.name(),
            model_out.desc.elem
        )));
    }
    if tile.core.y0 != out.y0 || tile.core.y1 != out.y1 {
        return Err(PipelineError::contract(format!(
            "tile ({}, {}) rows {}..{} do not match output strip {}..{}",
            tile.xi, tile.yi, tile.core.y0, tile.core.y1, out.y0, out.y1
        )));
    }

    let src = model_out.desc;
    let constants = PostprocessConstants {
        src_w: src.width,
        src_h: src.height,
        src_cstep: src.width * src.height,
        dst_w: out.buffer.desc.width,
        dst_h: out.buffer.desc.height,
        dst_stride: out.buffer.desc.width * CHANNELS as u32,
        mean: blend.mean,
        crop_left: tile.crop_left(),
        crop_top: tile.crop_top(),
        xoffset: tile.core.x0,
    };
    stream.record_dispatch(
        kernel.pipeline(),
        model_out,
        out.buffer,
        KernelConstants::Postprocess(constants),
        [tile.core.width(), tile.core.height(), CHANNELS as u32],
    )
}

/// Record the copy of a finished output strip into a staging buffer.
pub fn download_strip(
    stream: &mut CommandStream<'_>,
    scope: &mut FrameScope<'_>,
    out: &OutputStrip,
) -> Result<BufferRef> {
    let staging = scope.staging_buffer(out.buffer.desc)?;
    stream.record_download(out.buffer, staging)?;
    Ok(staging)
}
