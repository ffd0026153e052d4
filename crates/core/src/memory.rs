//! Allocator scopes and buffer lifetimes for one frame.
//!
//! A [`FrameScope`] holds the blob and staging allocators for exactly one
//! frame. Buffers it hands out are parked with a [`BufferLifetime`] and only
//! released at a point where the command stream has been waited on, so no
//! buffer is freed while recorded work may still read it.

use std::sync::Arc;

use tracing::trace;

use crate::device::{
    AllocatorHandle, AllocatorKind, BufferDesc, BufferId, BufferRef, CommandStream,
    ComputeBackend,
};
use crate::error::{PipelineError, Result};

/// How long a buffer may outlive the command that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferLifetime {
    /// Released at the barrier ending the tile.
    Tile,
    /// Released at the barrier ending the tile row.
    Row,
    /// Released when the scope is dropped.
    Frame,
}

pub struct MemoryLifecycle {
    backend: Arc<dyn ComputeBackend>,
    in_flight: bool,
}

impl MemoryLifecycle {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            in_flight: false,
        }
    }

    /// Acquire the blob and staging allocators for one frame.
    ///
    /// The scope borrows the manager mutably, so a second scope cannot be
    /// opened while one is alive. A scope that was leaked instead of dropped
    /// leaves the manager marked in flight and every later call fails with
    /// [`PipelineError::ScopeInUse`].
    pub fn acquire_scope(&mut self) -> Result<FrameScope<'_>> {
        if self.in_flight {
            return Err(PipelineError::ScopeInUse);
        }

        let blob = self.backend.acquire_allocator(AllocatorKind::Blob)?;
        let staging = match self.backend.acquire_allocator(AllocatorKind::Staging) {
            Ok(staging) => staging,
            Err(e) => {
                self.backend.reclaim_allocator(blob);
                return Err(e);
            }
        };

        self.in_flight = true;
        Ok(FrameScope {
            manager: self,
            blob: Some(blob),
            staging: Some(staging),
            parked: Vec::new(),
        })
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

pub struct FrameScope<'a> {
    manager: &'a mut MemoryLifecycle,
    blob: Option<AllocatorHandle>,
    staging: Option<AllocatorHandle>,
    parked: Vec<(BufferId, BufferLifetime)>,
}

impl FrameScope<'_> {
    /// Device-local buffer from the blob allocator.
    pub fn buffer(&mut self, desc: BufferDesc, lifetime: BufferLifetime) -> Result<BufferRef> {
        let allocator = self
            .blob
            .as_ref()
            .ok_or_else(|| PipelineError::contract("blob allocator already reclaimed"))?;
        let buffer = self.manager.backend.create_buffer(allocator, desc)?;
        self.parked.push((buffer.id, lifetime));
        Ok(buffer)
    }

    /// Host-visible buffer from the staging allocator, released with the row.
    pub fn staging_buffer(&mut self, desc: BufferDesc) -> Result<BufferRef> {
        let allocator = self
            .staging
            .as_ref()
            .ok_or_else(|| PipelineError::contract("staging allocator already reclaimed"))?;
        let buffer = self.manager.backend.create_buffer(allocator, desc)?;
        self.parked.push((buffer.id, BufferLifetime::Row));
        Ok(buffer)
    }

    pub fn read_staging(&self, buffer: BufferRef, out: &mut [u8]) -> Result<()> {
        self.manager.backend.read_staging(buffer, out)
    }

    /// Release every parked buffer whose lifetime ends at or before `upto`.
    ///
    /// `stream` must have nothing recorded since its last wait.
    pub fn release_pending(&mut self, stream: &CommandStream<'_>, upto: BufferLifetime) -> Result<usize> {
        if stream.has_pending() {
            return Err(PipelineError::contract(
                "buffers released while recorded commands are still pending",
            ));
        }

        let backend = &self.manager.backend;
        let before = self.parked.len();
        self.parked.retain(|&(id, lifetime)| {
            if lifetime <= upto {
                backend.release_buffer(id);
                false
            } else {
                true
            }
        });
        let released = before - self.parked.len();
        trace!(released, ?upto, "Released parked buffers");
        Ok(released)
    }

    /// Buffers still owned by this scope.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Release everything and return both allocators.
    pub fn reclaim(self) {}
}

impl Drop for FrameScope<'_> {
    fn drop(&mut self) {
        let backend = &self.manager.backend;
        for (id, _) in self.parked.drain(..) {
            backend.release_buffer(id);
        }
        if let Some(staging) = self.staging.take() {
            backend.reclaim_allocator(staging);
        }
        if let Some(blob) = self.blob.take() {
            backend.reclaim_allocator(blob);
        }
        self.manager.in_flight = false;
    }
}
