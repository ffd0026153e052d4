//! Error taxonomy for the interpolation pipeline.
//!
//! Every failure is fatal to the frame that produced it. [`ErrorClass`] tells a
//! caller whether the input was wrong, the device or model failed, or the
//! pipeline itself computed something inconsistent.

use thiserror::Error;

use crate::pipeline::PipelineState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad caller input, detected before any GPU work.
    Configuration,
    /// Kernel compilation, allocation or inference failure.
    Backend,
    /// Internal inconsistency between the planner and a kernel.
    Contract,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("frame has zero extent ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("input frames differ in size: {first_w}x{first_h} vs {second_w}x{second_h}")]
    DimensionMismatch {
        first_w: u32,
        first_h: u32,
        second_w: u32,
        second_h: u32,
    },

    #[error("output frame is {actual_w}x{actual_h}, inputs are {expected_w}x{expected_h}")]
    OutputMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },

    #[error("frame pixel layout {actual:?} does not match pipeline layout {expected:?}")]
    LayoutMismatch {
        expected: crate::layout::PixelLayout,
        actual: crate::layout::PixelLayout,
    },

    #[error("interpolation factor {0} is outside [0, 1]")]
    InvalidFactor(f32),

    #[error("pipeline is {0}, expected ready")]
    NotReady(PipelineState),

    #[error("cannot move pipeline from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("allocator scope is still held by a previous frame")]
    ScopeInUse,

    #[error("kernel {kernel} failed to compile: {reason}")]
    KernelCompile { kernel: String, reason: String },

    #[error("allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: u64, reason: String },

    #[error("compute backend error: {0}")]
    Backend(String),

    #[error("model load failed")]
    ModelLoad(#[source] BoxError),

    #[error("inference failed on tile ({xi}, {yi})")]
    Inference {
        xi: u32,
        yi: u32,
        #[source]
        source: BoxError,
    },

    #[error("pipeline contract violated: {0}")]
    Contract(String),
}

impl PipelineError {
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidConfig(_)
            | Self::EmptyFrame { .. }
            | Self::FrameSize { .. }
            | Self::DimensionMismatch { .. }
            | Self::OutputMismatch { .. }
            | Self::LayoutMismatch { .. }
            | Self::InvalidFactor(_)
            | Self::NotReady(_)
            | Self::InvalidTransition { .. } => ErrorClass::Configuration,
            Self::KernelCompile { .. }
            | Self::Allocation { .. }
            | Self::Backend(_)
            | Self::ModelLoad(_)
            | Self::Inference { .. } => ErrorClass::Backend,
            Self::ScopeInUse | Self::Contract(_) => ErrorClass::Contract,
        }
    }
}
