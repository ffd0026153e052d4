//! Tile-loop orchestration for one interpolation pipeline instance.
//!
//! ```text
//!  Uninitialized --load_engine--> Loaded --compile_kernels--> Ready
//!                                                              |  ^
//!                                                      process |  | frame done / failed
//!                                                              v  |
//!                                                         ProcessingFrame
//! ```
//!
//! Per tile row the two input strips are uploaded once, then every tile runs
//! preprocess(A), preprocess(B), inference and postprocess against the shared
//! strips. Grids with more than one tile column wait on the device after every
//! tile to cap peak memory; single-column grids batch the whole row into one
//! submission. Each row ends with a download barrier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::device::{CommandStream, ComputeBackend, ElementType};
use crate::engine::{record_inference, InferenceEngine};
use crate::error::{PipelineError, Result};
use crate::kernels::{CompiledKernel, KernelKey};
use crate::layout::PixelLayout;
use crate::memory::{BufferLifetime, MemoryLifecycle};
use crate::normalize::{self, Normalization};
use crate::postprocess::{download_strip, output_strip, record_postprocess};
use crate::preprocess::{record_preprocess, upload_strip};
use crate::tiling::{self, TileGrid, TilePolicy, TileSpec};
use crate::types::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Uninitialized,
    Loaded,
    Ready,
    ProcessingFrame,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Loaded => write!(f, "loaded"),
            Self::Ready => write!(f, "ready"),
            Self::ProcessingFrame => write!(f, "processing a frame"),
        }
    }
}

/// When the tile loop waits on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// One submission per tile row.
    Batched,
    /// A barrier after the strip upload and after every tile.
    PerTile,
}

impl SyncPolicy {
    pub fn for_grid(grid: &TileGrid) -> Self {
        if grid.xtiles > 1 {
            Self::PerTile
        } else {
            Self::Batched
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub tiling: TilePolicy,
    pub normalization: Normalization,
    /// Element type of model tensors: `F16` or `F32`.
    pub storage: ElementType,
    pub layout: PixelLayout,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tiling: TilePolicy::default(),
            normalization: Normalization::default(),
            storage: ElementType::F16,
            layout: PixelLayout::native(),
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        self.tiling.validate()?;
        if self.storage == ElementType::U8 {
            return Err(PipelineError::config("tensor storage must be f16 or f32"));
        }
        Ok(())
    }
}

/// What one `process` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub width: u32,
    pub height: u32,
    /// Set when the factor was 0 or 1 and an input was copied.
    pub shortcut: bool,
    pub spec: Option<TileSpec>,
    pub sync: Option<SyncPolicy>,
    pub tiles: usize,
    pub xtiles: u32,
    pub ytiles: u32,
    pub barriers: u32,
    pub elapsed: Duration,
}

impl FrameReport {
    fn shortcut(width: u32, height: u32, started: Instant) -> Self {
        Self {
            width,
            height,
            shortcut: true,
            spec: None,
            sync: None,
            tiles: 0,
            xtiles: 0,
            ytiles: 0,
            barriers: 0,
            elapsed: started.elapsed(),
        }
    }
}

struct KernelPair {
    preprocess: CompiledKernel,
    postprocess: CompiledKernel,
}

pub struct InterpolationPipeline {
    kernels: Option<KernelPair>,
    engine: Option<Arc<dyn InferenceEngine>>,
    memory: MemoryLifecycle,
    backend: Arc<dyn ComputeBackend>,
    options: PipelineOptions,
    state: PipelineState,
}

impl InterpolationPipeline {
    pub fn new(backend: Arc<dyn ComputeBackend>, options: PipelineOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            kernels: None,
            engine: None,
            memory: MemoryLifecycle::new(Arc::clone(&backend)),
            backend,
            options,
            state: PipelineState::Uninitialized,
        })
    }

    /// Create a pipeline and bring it to [`PipelineState::Ready`].
    pub fn load(
        backend: Arc<dyn ComputeBackend>,
        engine: Arc<dyn InferenceEngine>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let mut pipeline = Self::new(backend, options)?;
        pipeline.load_engine(engine)?;
        pipeline.compile_kernels()?;
        Ok(pipeline)
    }

    pub fn load_engine(&mut self, engine: Arc<dyn InferenceEngine>) -> Result<()> {
        self.transition(
            &[PipelineState::Uninitialized, PipelineState::Loaded],
            PipelineState::Loaded,
        )?;
        debug!(engine = engine.name(), "Attached inference engine");
        self.engine = Some(engine);
        self.state = PipelineState::Loaded;
        Ok(())
    }

    pub fn compile_kernels(&mut self) -> Result<()> {
        self.transition(&[PipelineState::Loaded], PipelineState::Ready)?;
        let PipelineOptions {
            layout,
            normalization,
            storage,
            ..
        } = self.options;

        let preprocess = CompiledKernel::load(
            &self.backend,
            KernelKey::preprocess(layout, normalization, storage),
        )?;
        let postprocess = CompiledKernel::load(
            &self.backend,
            KernelKey::postprocess(layout, normalization, storage),
        )?;

        info!(
            backend = self.backend.name(),
            preprocess = %preprocess.key().name(),
            postprocess = %postprocess.key().name(),
            "Interpolation pipeline ready"
        );
        self.kernels = Some(KernelPair {
            preprocess,
            postprocess,
        });
        self.state = PipelineState::Ready;
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Synthesize the frame at `factor` between `frame0` and `frame1` into
    /// `out`. On error `out` is left untouched.
    pub fn process(
        &mut self,
        frame0: &Frame,
        frame1: &Frame,
        factor: f32,
        out: &mut Frame,
    ) -> Result<FrameReport> {
        if self.state != PipelineState::Ready {
            return Err(PipelineError::NotReady(self.state));
        }
        self.validate_frames(frame0, frame1, out)?;
        if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
            return Err(PipelineError::InvalidFactor(factor));
        }

        let started = Instant::now();
        let (width, height) = frame0.dimensions();
        if factor == 0.0 || factor == 1.0 {
            let source = if factor == 0.0 { frame0 } else { frame1 };
            out.copy_from(source);
            debug!(width, height, factor, "Copied input frame");
            return Ok(FrameReport::shortcut(width, height, started));
        }

        self.state = PipelineState::ProcessingFrame;
        let rendered = self.render(frame0, frame1, factor);
        self.state = PipelineState::Ready;

        let (staged, grid, sync, barriers) = rendered?;
        out.data_mut().copy_from_slice(&staged);

        let report = FrameReport {
            width,
            height,
            shortcut: false,
            spec: Some(grid.spec),
            sync: Some(sync),
            tiles: grid.len(),
            xtiles: grid.xtiles,
            ytiles: grid.ytiles,
            barriers,
            elapsed: started.elapsed(),
        };
        debug!(
            width,
            height,
            tiles = report.tiles,
            barriers,
            sync = ?sync,
            elapsed_ms = format!("{:.1}", report.elapsed.as_secs_f64() * 1000.0),
            "Interpolated frame"
        );
        Ok(report)
    }

    fn validate_frames(&self, frame0: &Frame, frame1: &Frame, out: &Frame) -> Result<()> {
        let (w0, h0) = frame0.dimensions();
        let (w1, h1) = frame1.dimensions();
        if (w0, h0) != (w1, h1) {
            return Err(PipelineError::DimensionMismatch {
                first_w: w0,
                first_h: h0,
                second_w: w1,
                second_h: h1,
            });
        }
        if out.dimensions() != (w0, h0) {
            return Err(PipelineError::OutputMismatch {
                expected_w: w0,
                expected_h: h0,
                actual_w: out.width(),
                actual_h: out.height(),
            });
        }
        for frame in [frame0, frame1, out] {
            if frame.layout() != self.options.layout {
                return Err(PipelineError::LayoutMismatch {
                    expected: self.options.layout,
                    actual: frame.layout(),
                });
            }
        }
        Ok(())
    }

    fn render(
        &mut self,
        frame0: &Frame,
        frame1: &Frame,
        factor: f32,
    ) -> Result<(Vec<u8>, TileGrid, SyncPolicy, u32)> {
        let (Some(kernels), Some(engine)) = (self.kernels.as_ref(), self.engine.as_ref()) else {
            return Err(PipelineError::NotReady(self.state));
        };

        let (width, height) = frame0.dimensions();
        let spec = self
            .options
            .tiling
            .resolve(width, height, self.backend.heap_budget());
        let grid = tiling::plan(width, height, &spec)?;
        let sync = SyncPolicy::for_grid(&grid);
        let storage = self.options.storage;

        let stats0 = normalize::mean(frame0);
        let stats1 = normalize::mean(frame1);
        let blend = stats0.blend(&stats1);

        let backend = Arc::clone(&self.backend);
        let mut stream = CommandStream::new(backend.as_ref());
        let mut scope = self.memory.acquire_scope()?;
        let mut staged = vec![0u8; frame0.data().len()];
        let stride = frame0.row_stride();
        let mut barriers = 0u32;

        for row in grid.rows() {
            let first = &row[0];
            let strip0 = upload_strip(&mut stream, &mut scope, frame0, first)?;
            let strip1 = upload_strip(&mut stream, &mut scope, frame1, first)?;
            let out = output_strip(&mut scope, width, first)?;
            if sync == SyncPolicy::PerTile {
                stream.barrier()?;
                barriers += 1;
            }

            for tile in row {
                trace!(tile = ?(tile.xi, tile.yi), core = ?tile.core, padded = ?tile.padded, "Recording tile");
                let in0 = record_preprocess(
                    &mut stream,
                    &mut scope,
                    &kernels.preprocess,
                    &strip0,
                    tile,
                    &stats0,
                    storage,
                )?;
                let in1 = record_preprocess(
                    &mut stream,
                    &mut scope,
                    &kernels.preprocess,
                    &strip1,
                    tile,
                    &stats1,
                    storage,
                )?;
                let model_out = record_inference(
                    &mut stream,
                    &mut scope,
                    engine,
                    [in0, in1],
                    tile,
                    factor,
                    storage,
                )?;
                record_postprocess(
                    &mut stream,
                    &kernels.postprocess,
                    model_out,
                    &out,
                    tile,
                    &blend,
                )?;

                if sync == SyncPolicy::PerTile {
                    stream.barrier()?;
                    barriers += 1;
                    scope.release_pending(&stream, BufferLifetime::Tile)?;
                }
            }

            let staging = download_strip(&mut stream, &mut scope, &out)?;
            stream.barrier()?;
            barriers += 1;
            let rows = out.y0 as usize * stride..out.y1 as usize * stride;
            scope.read_staging(staging, &mut staged[rows])?;
            scope.release_pending(&stream, BufferLifetime::Row)?;
        }

        scope.reclaim();
        Ok((staged, grid, sync, barriers))
    }

    fn transition(&self, allowed: &[PipelineState], to: PipelineState) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

impl Drop for InterpolationPipeline {
    fn drop(&mut self) {
        // Kernels reference device pipelines; release them before the engine
        // and the backend handle go away.
        self.kernels.take();
        self.engine.take();
    }
}
