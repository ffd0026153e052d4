//! Compute backend contract.
//!
//! A backend owns device memory, compiled kernel pipelines and a submission
//! queue. Work is never executed eagerly: the pipeline records commands into
//! a [`CommandStream`] and nothing happens on the device until
//! [`CommandStream::submit_and_wait`], which blocks until every recorded
//! command has completed.

use std::sync::Arc;

use serde::Serialize;

use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::kernels::{KernelConstants, KernelModule};

pub mod host;

pub use host::{DeviceStats, HostBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    F16,
    F32,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 => 2,
            Self::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLayout {
    /// `[y][x][c]`, as decoded images are stored.
    Interleaved,
    /// `[c][y][x]`, as the model consumes tensors.
    Planar,
}

/// Shape and element type of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub elem: ElementType,
    pub layout: MemoryLayout,
}

impl BufferDesc {
    pub fn interleaved_u8(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: crate::layout::CHANNELS as u32,
            elem: ElementType::U8,
            layout: MemoryLayout::Interleaved,
        }
    }

    pub fn planar(width: u32, height: u32, elem: ElementType) -> Self {
        Self {
            width,
            height,
            channels: crate::layout::CHANNELS as u32,
            elem,
            layout: MemoryLayout::Planar,
        }
    }

    pub fn elements(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn byte_len(&self) -> u64 {
        self.elements() as u64 * self.elem.size() as u64
    }

    /// Distance in elements between two rows (interleaved) or two planes
    /// (planar).
    pub fn step(&self) -> u32 {
        match self.layout {
            MemoryLayout::Interleaved => self.width * self.channels,
            MemoryLayout::Planar => self.width * self.height,
        }
    }

    pub fn same_extent(&self, other: &BufferDesc) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Non-owning reference to a live buffer, valid until the allocator scope
/// that created it releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    pub id: BufferId,
    pub desc: BufferDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Device-local memory for tensors.
    Blob,
    /// Host-visible memory for readback.
    Staging,
}

/// Allocator scope issued by a backend. Returned through
/// [`ComputeBackend::reclaim_allocator`].
#[derive(Debug, PartialEq, Eq)]
pub struct AllocatorHandle {
    id: u64,
    kind: AllocatorKind,
}

impl AllocatorHandle {
    pub fn new(id: u64, kind: AllocatorKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

pub enum Command {
    /// Host bytes into an interleaved u8 buffer.
    Upload { dst: BufferRef, bytes: Vec<u8> },
    Dispatch {
        pipeline: PipelineHandle,
        src: BufferRef,
        dst: BufferRef,
        constants: KernelConstants,
        /// Invocation grid `[x, y, channels]`.
        extent: [u32; 3],
    },
    Inference {
        engine: Arc<dyn InferenceEngine>,
        inputs: [BufferRef; 2],
        output: BufferRef,
        timestep: f32,
        tile: (u32, u32),
    },
    /// Device buffer into a staging buffer of the same shape.
    Download { src: BufferRef, dst: BufferRef },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "upload",
            Self::Dispatch { .. } => "dispatch",
            Self::Inference { .. } => "inference",
            Self::Download { .. } => "download",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload { dst, bytes } => f
                .debug_struct("Upload")
                .field("dst", &dst.id)
                .field("bytes", &bytes.len())
                .finish(),
            Self::Dispatch {
                pipeline,
                src,
                dst,
                extent,
                ..
            } => f
                .debug_struct("Dispatch")
                .field("pipeline", pipeline)
                .field("src", &src.id)
                .field("dst", &dst.id)
                .field("extent", extent)
                .finish(),
            Self::Inference {
                engine,
                output,
                tile,
                ..
            } => f
                .debug_struct("Inference")
                .field("engine", &engine.name())
                .field("output", &output.id)
                .field("tile", tile)
                .finish(),
            Self::Download { src, dst } => f
                .debug_struct("Download")
                .field("src", &src.id)
                .field("dst", &dst.id)
                .finish(),
        }
    }
}

pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Device memory available to one frame, if the backend can tell.
    fn heap_budget(&self) -> Option<u64>;

    fn create_pipeline(&self, module: &Arc<KernelModule>) -> Result<PipelineHandle>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn acquire_allocator(&self, kind: AllocatorKind) -> Result<AllocatorHandle>;

    fn reclaim_allocator(&self, allocator: AllocatorHandle);

    fn create_buffer(&self, allocator: &AllocatorHandle, desc: BufferDesc) -> Result<BufferRef>;

    fn release_buffer(&self, buffer: BufferId);

    /// Execute `commands` in order and block until all of them completed.
    fn submit_and_wait(&self, commands: Vec<Command>) -> Result<()>;

    /// Copy the contents of a staging buffer to host memory.
    fn read_staging(&self, buffer: BufferRef, out: &mut [u8]) -> Result<()>;
}

/// Deferred command recorder for one frame.
///
/// After a submit the stream is sealed until [`reset`](Self::reset) is
/// called; recording into a sealed stream is a contract violation.
pub struct CommandStream<'a> {
    backend: &'a dyn ComputeBackend,
    pending: Vec<Command>,
    sealed: bool,
    submits: u32,
}

impl<'a> CommandStream<'a> {
    pub fn new(backend: &'a dyn ComputeBackend) -> Self {
        Self {
            backend,
            pending: Vec::new(),
            sealed: false,
            submits: 0,
        }
    }

    pub fn backend(&self) -> &'a dyn ComputeBackend {
        self.backend
    }

    pub fn record_upload(&mut self, dst: BufferRef, bytes: Vec<u8>) -> Result<()> {
        if dst.desc.elem != ElementType::U8 || bytes.len() as u64 != dst.desc.byte_len() {
            return Err(PipelineError::contract(format!(
                "upload of {} bytes into {:?}",
                bytes.len(),
                dst.desc
            )));
        }
        self.push(Command::Upload { dst, bytes })
    }

    pub fn record_dispatch(
        &mut self,
        pipeline: PipelineHandle,
        src: BufferRef,
        dst: BufferRef,
        constants: KernelConstants,
        extent: [u32; 3],
    ) -> Result<()> {
        self.push(Command::Dispatch {
            pipeline,
            src,
            dst,
            constants,
            extent,
        })
    }

    pub fn record_inference(
        &mut self,
        engine: Arc<dyn InferenceEngine>,
        inputs: [BufferRef; 2],
        output: BufferRef,
        timestep: f32,
        tile: (u32, u32),
    ) -> Result<()> {
        self.push(Command::Inference {
            engine,
            inputs,
            output,
            timestep,
            tile,
        })
    }

    pub fn record_download(&mut self, src: BufferRef, dst: BufferRef) -> Result<()> {
        if src.desc != dst.desc {
            return Err(PipelineError::contract(format!(
                "download from {:?} into {:?}",
                src.desc, dst.desc
            )));
        }
        self.push(Command::Download { src, dst })
    }

    pub fn submit_and_wait(&mut self) -> Result<()> {
        if self.sealed {
            return Err(PipelineError::contract("submit on a stream that was not reset"));
        }
        self.sealed = true;
        self.submits += 1;
        let commands = std::mem::take(&mut self.pending);
        self.backend.submit_and_wait(commands)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.sealed = false;
    }

    /// Submit, wait and reset in one step.
    pub fn barrier(&mut self) -> Result<()> {
        let result = self.submit_and_wait();
        self.reset();
        result
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn submits(&self) -> u32 {
        self.submits
    }

    fn push(&mut self, command: Command) -> Result<()> {
        if self.sealed {
            return Err(PipelineError::contract(format!(
                "{} recorded after submit without reset",
                command.label()
            )));
        }
        self.pending.push(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_desc_sizes() {
        let desc = BufferDesc::planar(288, 288, ElementType::F16);
        assert_eq!(desc.elements(), 288 * 288 * 3);
        assert_eq!(desc.byte_len(), 288 * 288 * 3 * 2);
        assert_eq!(desc.step(), 288 * 288);
    }

    #[test]
    fn test_interleaved_step_is_row_stride() {
        let desc = BufferDesc::interleaved_u8(300, 40);
        assert_eq!(desc.step(), 900);
        assert_eq!(desc.byte_len(), 300 * 40 * 3);
    }

    #[test]
    fn test_sealed_stream_rejects_recording() {
        let backend = HostBackend::new();
        let allocator = backend
            .acquire_allocator(AllocatorKind::Blob)
            .expect("allocator");
        let buffer = backend
            .create_buffer(&allocator, BufferDesc::interleaved_u8(2, 2))
            .expect("buffer");

        let mut stream = CommandStream::new(&backend);
        stream
            .record_upload(buffer, vec![7; 12])
            .expect("first upload");
        stream.submit_and_wait().expect("submit");
        assert!(!stream.has_pending());

        let err = stream.record_upload(buffer, vec![7; 12]).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Contract);

        stream.reset();
        stream
            .record_upload(buffer, vec![9; 12])
            .expect("upload after reset");
        stream.barrier().expect("barrier");
        assert_eq!(stream.submits(), 2);

        backend.release_buffer(buffer.id);
        backend.reclaim_allocator(allocator);
    }

    #[test]
    fn test_upload_length_must_match_buffer() {
        let backend = HostBackend::new();
        let allocator = backend
            .acquire_allocator(AllocatorKind::Blob)
            .expect("allocator");
        let buffer = backend
            .create_buffer(&allocator, BufferDesc::interleaved_u8(2, 2))
            .expect("buffer");
        let mut stream = CommandStream::new(&backend);
        assert!(stream.record_upload(buffer, vec![0; 11]).is_err());
    }
}
