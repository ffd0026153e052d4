//! Preprocess and postprocess kernels.
//!
//! Kernel modules are compiled once per process and per [`KernelKey`] through
//! the global [`KernelRegistry`]; each pipeline then instantiates them on its
//! backend as [`CompiledKernel`]s, which release their device pipeline on
//! drop. The host reference implementation of both kernels lives here too so
//! any backend that executes on host memory can share it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use half::f16;
use tracing::debug;

use crate::device::{ComputeBackend, ElementType, PipelineHandle};
use crate::error::{PipelineError, Result};
use crate::layout::{PixelLayout, CHANNELS};
use crate::normalize::Normalization;

/// Workgroup size every kernel is built with.
pub const LOCAL_SIZE: [u32; 3] = [8, 8, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Preprocess,
    Postprocess,
}

impl std::fmt::Display for KernelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preprocess => write!(f, "preproc"),
            Self::Postprocess => write!(f, "postproc"),
        }
    }
}

/// Kernel identity: kind plus every specialization baked into the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub kind: KernelKind,
    pub layout: PixelLayout,
    pub normalization: Normalization,
    /// Element type of the planar tensor side.
    pub storage: ElementType,
}

impl KernelKey {
    pub fn preprocess(layout: PixelLayout, normalization: Normalization, storage: ElementType) -> Self {
        Self {
            kind: KernelKind::Preprocess,
            layout,
            normalization,
            storage,
        }
    }

    pub fn postprocess(layout: PixelLayout, normalization: Normalization, storage: ElementType) -> Self {
        Self {
            kind: KernelKind::Postprocess,
            layout,
            normalization,
            storage,
        }
    }

    pub fn name(&self) -> String {
        let norm = match self.normalization {
            Normalization::MeanCentered => "norm",
            Normalization::Raw => "raw",
        };
        let storage = match self.storage {
            ElementType::U8 => "u8",
            ElementType::F16 => "fp16",
            ElementType::F32 => "fp32",
        };
        format!("{}_{}_{}_{}", self.kind, norm, storage, self.layout)
    }
}

/// Compiled, immutable kernel module.
#[derive(Debug)]
pub struct KernelModule {
    pub key: KernelKey,
    pub local_size: [u32; 3],
    /// Specialization constants in binding order: layout, normalization.
    pub specialization: [u32; 2],
}

impl KernelModule {
    pub fn compile(key: KernelKey) -> Result<Self> {
        if key.storage == ElementType::U8 {
            return Err(PipelineError::KernelCompile {
                kernel: key.name(),
                reason: "tensor storage must be fp16 or fp32".to_string(),
            });
        }
        Ok(Self {
            key,
            local_size: LOCAL_SIZE,
            specialization: [
                key.layout.specialization(),
                u32::from(key.normalization.is_centered()),
            ],
        })
    }
}

/// Process-wide cache of compiled kernel modules.
pub struct KernelRegistry {
    modules: Mutex<HashMap<KernelKey, Arc<KernelModule>>>,
    compiles: AtomicUsize,
}

static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn global() -> &'static KernelRegistry {
        REGISTRY.get_or_init(KernelRegistry::new)
    }

    /// Return the module for `key`, compiling it on first use. Concurrent
    /// callers for the same key block on the registry lock, so each key is
    /// compiled at most once.
    pub fn get_or_compile(&self, key: KernelKey) -> Result<Arc<KernelModule>> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = modules.get(&key) {
            return Ok(Arc::clone(module));
        }

        let module = Arc::new(KernelModule::compile(key)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        debug!(kernel = %key.name(), "Compiled kernel module");
        modules.insert(key, Arc::clone(&module));
        Ok(module)
    }

    /// Number of modules compiled by this registry so far.
    pub fn compiled(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A kernel module instantiated as a pipeline on one backend.
pub struct CompiledKernel {
    backend: Arc<dyn ComputeBackend>,
    module: Arc<KernelModule>,
    pipeline: PipelineHandle,
}

impl CompiledKernel {
    pub fn load(backend: &Arc<dyn ComputeBackend>, key: KernelKey) -> Result<Self> {
        let module = KernelRegistry::global().get_or_compile(key)?;
        let pipeline = backend.create_pipeline(&module)?;
        Ok(Self {
            backend: Arc::clone(backend),
            module,
            pipeline,
        })
    }

    pub fn key(&self) -> KernelKey {
        self.module.key
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }
}

impl Drop for CompiledKernel {
    fn drop(&mut self) {
        self.backend.destroy_pipeline(self.pipeline);
    }
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("kernel", &self.module.key.name())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConstants {
    pub src_w: u32,
    pub src_h: u32,
    /// Bytes per source row.
    pub src_stride: u32,
    pub dst_w: u32,
    pub dst_h: u32,
    /// Elements per destination plane.
    pub dst_cstep: u32,
    pub mean: [f32; CHANNELS],
    pub prepadding: u32,
    pub clamp_left: u32,
    /// Source column of the tile's core origin.
    pub xoffset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConstants {
    pub src_w: u32,
    pub src_h: u32,
    pub src_cstep: u32,
    pub dst_w: u32,
    pub dst_h: u32,
    pub dst_stride: u32,
    pub mean: [f32; CHANNELS],
    pub crop_left: u32,
    pub crop_top: u32,
    pub xoffset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelConstants {
    Preprocess(PreprocessConstants),
    Postprocess(PostprocessConstants),
}

impl KernelConstants {
    pub fn kind(&self) -> KernelKind {
        match self {
            Self::Preprocess(_) => KernelKind::Preprocess,
            Self::Postprocess(_) => KernelKind::Postprocess,
        }
    }
}

/// Tensor element the kernels can read and write.
pub trait Texel: Copy + Default + Send + Sync + 'static {
    fn from_f32(value: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Texel for f32 {
    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_f32(self) -> f32 {
        self
    }
}

impl Texel for f16 {
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

/// Interleaved u8 strip to planar model tensor.
///
/// Model texel `(tx, ty)` samples strip pixel
/// `(xoffset + tx - (prepadding - clamp_left), ty)`. Samples past the strip
/// are filled with the mean, which is zero once centered.
pub fn run_preprocess<T: Texel>(
    key: &KernelKey,
    c: &PreprocessConstants,
    src: &[u8],
    dst: &mut [T],
) -> Result<()> {
    let shift = c.prepadding.checked_sub(c.clamp_left).ok_or_else(|| {
        PipelineError::contract(format!(
            "edge clamp {} exceeds prepadding {}",
            c.clamp_left, c.prepadding
        ))
    })?;
    if c.dst_cstep != c.dst_w * c.dst_h || dst.len() != c.dst_cstep as usize * CHANNELS {
        return Err(PipelineError::contract(format!(
            "preprocess target holds {} texels, expected {}x{}x{}",
            dst.len(),
            c.dst_w,
            c.dst_h,
            CHANNELS
        )));
    }
    if c.src_stride < c.src_w * CHANNELS as u32
        || src.len() < c.src_stride as usize * c.src_h as usize
    {
        return Err(PipelineError::contract(format!(
            "preprocess source holds {} bytes, expected {} rows of {}",
            src.len(),
            c.src_h,
            c.src_stride
        )));
    }

    let centered = key.normalization.is_centered();
    let cstep = c.dst_cstep as usize;
    let dst_w = c.dst_w as usize;
    let stride = c.src_stride as usize;

    for channel in 0..CHANNELS {
        let plane = key.layout.model_channel(channel) * cstep;
        let mean = c.mean[channel];
        let fill = if centered { 0.0 } else { mean };
        for ty in 0..c.dst_h {
            let row = plane + ty as usize * dst_w;
            for tx in 0..c.dst_w {
                let sx = (c.xoffset + tx).checked_sub(shift);
                let value = match sx {
                    Some(sx) if sx < c.src_w && ty < c.src_h => {
                        let v = src[ty as usize * stride + sx as usize * CHANNELS + channel] as f32
                            / 255.0;
                        if centered {
                            v - mean
                        } else {
                            v
                        }
                    }
                    _ => fill,
                };
                dst[row + tx as usize] = T::from_f32(value);
            }
        }
    }
    Ok(())
}

/// Planar model tensor to interleaved u8 strip over an `extent[0] × extent[1]`
/// region, skipping `crop_left`/`crop_top` texels of context.
pub fn run_postprocess<T: Texel>(
    key: &KernelKey,
    c: &PostprocessConstants,
    extent: [u32; 3],
    src: &[T],
    dst: &mut [u8],
) -> Result<()> {
    let [w, h, _] = extent;
    if c.crop_left + w > c.src_w || c.crop_top + h > c.src_h {
        return Err(PipelineError::contract(format!(
            "crop {}x{} at ({}, {}) exceeds model output {}x{}",
            w, h, c.crop_left, c.crop_top, c.src_w, c.src_h
        )));
    }
    if c.xoffset + w > c.dst_w || h > c.dst_h {
        return Err(PipelineError::contract(format!(
            "write {}x{} at x={} exceeds output strip {}x{}",
            w, h, c.xoffset, c.dst_w, c.dst_h
        )));
    }
    if src.len() != c.src_cstep as usize * CHANNELS
        || dst.len() < c.dst_stride as usize * c.dst_h as usize
    {
        return Err(PipelineError::contract(format!(
            "postprocess buffers hold {} texels and {} bytes",
            src.len(),
            dst.len()
        )));
    }

    let centered = key.normalization.is_centered();
    let cstep = c.src_cstep as usize;
    let src_w = c.src_w as usize;
    let stride = c.dst_stride as usize;

    for channel in 0..CHANNELS {
        let plane = key.layout.model_channel(channel) * cstep;
        let bias = if centered { c.mean[channel] } else { 0.0 };
        for y in 0..h as usize {
            let src_row = plane + (y + c.crop_top as usize) * src_w + c.crop_left as usize;
            let dst_row = y * stride + c.xoffset as usize * CHANNELS;
            for x in 0..w as usize {
                let v = (src[src_row + x].to_f32() + bias) * 255.0;
                dst[dst_row + x * CHANNELS + channel] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    Ok(())
}
