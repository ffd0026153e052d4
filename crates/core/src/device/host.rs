//! Reference [`ComputeBackend`] executing on host memory.
//!
//! Buffers live in a map behind one mutex, commands run in submission order,
//! and every submit is counted so tests can observe how the pipeline batches
//! and synchronizes its work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array3, ArrayView3};
use serde::Serialize;
use tracing::trace;

use super::{
    AllocatorHandle, AllocatorKind, BufferDesc, BufferId, BufferRef, Command, ComputeBackend,
    ElementType, MemoryLayout, PipelineHandle,
};
use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::kernels::{run_postprocess, run_preprocess, KernelConstants, KernelModule};

/// Counters accumulated since the backend was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub submits: u64,
    pub uploads: u64,
    pub dispatches: u64,
    pub inferences: u64,
    pub downloads: u64,
    pub buffers_created: u64,
    pub live_buffers: u64,
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub pipelines_created: u64,
    pub live_pipelines: u64,
    pub live_allocators: u64,
}

enum Storage {
    U8(Vec<u8>),
    F16(Vec<f16>),
    F32(Vec<f32>),
}

impl Storage {
    fn zeroed(desc: &BufferDesc) -> Self {
        let n = desc.elements();
        match desc.elem {
            ElementType::U8 => Self::U8(vec![0; n]),
            ElementType::F16 => Self::F16(vec![f16::ZERO; n]),
            ElementType::F32 => Self::F32(vec![0.0; n]),
        }
    }
}

struct HostBuffer {
    desc: BufferDesc,
    allocator: u64,
    storage: Storage,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    buffers: HashMap<BufferId, HostBuffer>,
    allocators: HashMap<u64, AllocatorKind>,
    pipelines: HashMap<PipelineHandle, Arc<KernelModule>>,
    stats: DeviceStats,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct HostBackend {
    state: Mutex<HostState>,
    heap_budget: Option<u64>,
    memory_limit: Option<u64>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            heap_budget: None,
            memory_limit: None,
        }
    }

    /// Report `bytes` as the heap budget used for automatic tiling.
    pub fn with_heap_budget(mut self, bytes: u64) -> Self {
        self.heap_budget = Some(bytes);
        self
    }

    /// Fail allocations that would push live memory past `bytes`.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn stats(&self) -> DeviceStats {
        self.lock().stats
    }

    /// Run one engine call. The device lock is held only while inputs are
    /// read and the output is stored, never across `engine.run`.
    fn infer(
        &self,
        engine: &dyn InferenceEngine,
        inputs: [BufferRef; 2],
        output: BufferRef,
        timestep: f32,
        (xi, yi): (u32, u32),
    ) -> Result<()> {
        let (in0, in1) = {
            let mut state = self.lock();
            let in0 = read_planar(lookup(&state, inputs[0])?)?;
            let in1 = read_planar(lookup(&state, inputs[1])?)?;
            lookup(&state, output)?;
            state.stats.inferences += 1;
            (in0, in1)
        };

        let result = engine
            .run(in0.view(), in1.view(), timestep)
            .map_err(|e| PipelineError::Inference {
                xi,
                yi,
                source: e.into(),
            })?;
        let expected = in0.dim();
        if result.dim() != expected {
            return Err(PipelineError::contract(format!(
                "engine {} returned {:?} for tile ({xi}, {yi}), expected {:?}",
                engine.name(),
                result.dim(),
                expected
            )));
        }
        let storage = write_planar(result.view(), output.desc.elem)?;

        let mut state = self.lock();
        lookup(&state, output)?;
        put_storage(&mut state, output, storage);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn heap_budget(&self) -> Option<u64> {
        self.heap_budget
    }

    fn create_pipeline(&self, module: &Arc<KernelModule>) -> Result<PipelineHandle> {
        let mut state = self.lock();
        let handle = PipelineHandle(state.next_id());
        state.pipelines.insert(handle, Arc::clone(module));
        state.stats.pipelines_created += 1;
        state.stats.live_pipelines += 1;
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let mut state = self.lock();
        if state.pipelines.remove(&pipeline).is_some() {
            state.stats.live_pipelines -= 1;
        }
    }

    fn acquire_allocator(&self, kind: AllocatorKind) -> Result<AllocatorHandle> {
        let mut state = self.lock();
        let id = state.next_id();
        state.allocators.insert(id, kind);
        state.stats.live_allocators += 1;
        Ok(AllocatorHandle::new(id, kind))
    }

    fn reclaim_allocator(&self, allocator: AllocatorHandle) {
        let mut state = self.lock();
        let orphaned: Vec<BufferId> = state
            .buffers
            .iter()
            .filter(|(_, b)| b.allocator == allocator.id())
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            release_locked(&mut state, id);
        }
        if state.allocators.remove(&allocator.id()).is_some() {
            state.stats.live_allocators -= 1;
        }
    }

    fn create_buffer(&self, allocator: &AllocatorHandle, desc: BufferDesc) -> Result<BufferRef> {
        let bytes = desc.byte_len();
        let mut state = self.lock();
        if !state.allocators.contains_key(&allocator.id()) {
            return Err(PipelineError::Backend(format!(
                "allocator {} is not live",
                allocator.id()
            )));
        }
        if let Some(limit) = self.memory_limit {
            if state.stats.live_bytes + bytes > limit {
                return Err(PipelineError::Allocation {
                    bytes,
                    reason: format!(
                        "{} bytes live, limit {}",
                        state.stats.live_bytes, limit
                    ),
                });
            }
        }

        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            HostBuffer {
                desc,
                allocator: allocator.id(),
                storage: Storage::zeroed(&desc),
            },
        );
        let stats = &mut state.stats;
        stats.buffers_created += 1;
        stats.live_buffers += 1;
        stats.live_bytes += bytes;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        Ok(BufferRef { id, desc })
    }

    fn release_buffer(&self, buffer: BufferId) {
        release_locked(&mut self.lock(), buffer);
    }

    fn submit_and_wait(&self, commands: Vec<Command>) -> Result<()> {
        self.lock().stats.submits += 1;
        trace!(commands = commands.len(), "Executing submission");
        for command in commands {
            match command {
                Command::Inference {
                    engine,
                    inputs,
                    output,
                    timestep,
                    tile,
                } => self.infer(engine.as_ref(), inputs, output, timestep, tile)?,
                other => execute(&mut self.lock(), other)?,
            }
        }
        Ok(())
    }

    fn read_staging(&self, buffer: BufferRef, out: &mut [u8]) -> Result<()> {
        let state = self.lock();
        let host = lookup(&state, buffer)?;
        match state.allocators.get(&host.allocator) {
            Some(AllocatorKind::Staging) => {}
            _ => {
                return Err(PipelineError::contract(format!(
                    "buffer {:?} is not a staging buffer",
                    buffer.id
                )))
            }
        }
        match &host.storage {
            Storage::U8(bytes) if bytes.len() == out.len() => {
                out.copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(PipelineError::contract(format!(
                "readback of {:?} into {} bytes",
                buffer.desc,
                out.len()
            ))),
        }
    }
}

fn release_locked(state: &mut HostState, id: BufferId) {
    if let Some(buffer) = state.buffers.remove(&id) {
        state.stats.live_buffers -= 1;
        state.stats.live_bytes -= buffer.desc.byte_len();
    }
}

fn lookup<'s>(state: &'s HostState, buffer: BufferRef) -> Result<&'s HostBuffer> {
    let host = state
        .buffers
        .get(&buffer.id)
        .ok_or_else(|| PipelineError::contract(format!("buffer {:?} is not live", buffer.id)))?;
    if host.desc != buffer.desc {
        return Err(PipelineError::contract(format!(
            "buffer {:?} is {:?}, referenced as {:?}",
            buffer.id, host.desc, buffer.desc
        )));
    }
    Ok(host)
}

/// Detach a buffer's storage so it can be written while others are read.
fn take_storage(state: &mut HostState, buffer: BufferRef) -> Result<Storage> {
    lookup(state, buffer)?;
    let host = state
        .buffers
        .get_mut(&buffer.id)
        .ok_or_else(|| PipelineError::contract(format!("buffer {:?} is not live", buffer.id)))?;
    Ok(std::mem::replace(&mut host.storage, Storage::U8(Vec::new())))
}

fn put_storage(state: &mut HostState, buffer: BufferRef, storage: Storage) {
    if let Some(host) = state.buffers.get_mut(&buffer.id) {
        host.storage = storage;
    }
}

fn execute(state: &mut HostState, command: Command) -> Result<()> {
    match command {
        Command::Upload { dst, bytes } => {
            let mut storage = take_storage(state, dst)?;
            let result = match &mut storage {
                Storage::U8(data) if data.len() == bytes.len() => {
                    data.copy_from_slice(&bytes);
                    Ok(())
                }
                _ => Err(PipelineError::contract(format!(
                    "upload of {} bytes into {:?}",
                    bytes.len(),
                    dst.desc
                ))),
            };
            put_storage(state, dst, storage);
            state.stats.uploads += 1;
            result
        }
        Command::Download { src, dst } => {
            let bytes = match &lookup(state, src)?.storage {
                Storage::U8(data) => data.clone(),
                _ => {
                    return Err(PipelineError::contract(format!(
                        "download of non-u8 buffer {:?}",
                        src.desc
                    )))
                }
            };
            lookup(state, dst)?;
            put_storage(state, dst, Storage::U8(bytes));
            state.stats.downloads += 1;
            Ok(())
        }
        Command::Dispatch {
            pipeline,
            src,
            dst,
            constants,
            extent,
        } => {
            let module = state
                .pipelines
                .get(&pipeline)
                .cloned()
                .ok_or_else(|| PipelineError::Backend(format!("pipeline {pipeline:?} is not live")))?;
            if constants.kind() != module.key.kind {
                return Err(PipelineError::contract(format!(
                    "{} constants bound to {} pipeline",
                    constants.kind(),
                    module.key.kind
                )));
            }

            let mut out = take_storage(state, dst)?;
            let result = lookup(state, src)
                .and_then(|input| dispatch(&module, &constants, extent, &input.storage, &mut out));
            put_storage(state, dst, out);
            state.stats.dispatches += 1;
            result
        }
        Command::Inference { .. } => Err(PipelineError::contract(
            "inference commands run outside the device lock",
        )),
    }
}

fn dispatch(
    module: &KernelModule,
    constants: &KernelConstants,
    extent: [u32; 3],
    input: &Storage,
    out: &mut Storage,
) -> Result<()> {
    let key = &module.key;
    match (constants, input, out) {
        (KernelConstants::Preprocess(c), Storage::U8(src), Storage::F16(dst)) => {
            run_preprocess(key, c, src, dst)
        }
        (KernelConstants::Preprocess(c), Storage::U8(src), Storage::F32(dst)) => {
            run_preprocess(key, c, src, dst)
        }
        (KernelConstants::Postprocess(c), Storage::F16(src), Storage::U8(dst)) => {
            run_postprocess(key, c, extent, src, dst)
        }
        (KernelConstants::Postprocess(c), Storage::F32(src), Storage::U8(dst)) => {
            run_postprocess(key, c, extent, src, dst)
        }
        _ => Err(PipelineError::contract(format!(
            "{} bound to buffers of the wrong element type",
            key.name()
        ))),
    }
}

fn read_planar(buffer: &HostBuffer) -> Result<Array3<f32>> {
    let desc = buffer.desc;
    if desc.layout != MemoryLayout::Planar {
        return Err(PipelineError::contract(format!(
            "inference input {desc:?} is not planar"
        )));
    }
    let values = match &buffer.storage {
        Storage::F32(data) => data.clone(),
        Storage::F16(data) => {
            let mut out = vec![0.0f32; data.len()];
            data.convert_to_f32_slice(&mut out);
            out
        }
        Storage::U8(_) => {
            return Err(PipelineError::contract("inference input stored as u8"));
        }
    };
    let shape = (
        desc.channels as usize,
        desc.height as usize,
        desc.width as usize,
    );
    Array3::from_shape_vec(shape, values).map_err(|e| PipelineError::contract(e.to_string()))
}

fn write_planar(values: ArrayView3<'_, f32>, elem: ElementType) -> Result<Storage> {
    let flat: Vec<f32> = values.iter().copied().collect();
    match elem {
        ElementType::F32 => Ok(Storage::F32(flat)),
        ElementType::F16 => {
            let mut out = vec![f16::ZERO; flat.len()];
            out.convert_from_f32_slice(&flat);
            Ok(Storage::F16(out))
        }
        ElementType::U8 => Err(PipelineError::contract("inference output stored as u8")),
    }
}
