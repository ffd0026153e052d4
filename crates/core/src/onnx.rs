//! ONNX Runtime inference engine: CUDA EP, TensorRT EP, CPU and IoBinding.
//!
//! [`build_session`] creates the `ort::Session` with the requested execution
//! providers and optional TRT engine caching; [`OrtEngine`] wraps it behind
//! the [`InferenceEngine`] boundary.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use half::f16;
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::engine::{InferenceEngine, ModelBindings};
use crate::error::{PipelineError, Result};

/// Execution provider selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries
/// (`libnvinfer.so.10` or `nvinfer.dll`); if unavailable, the session falls
/// back to CUDA EP automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    pub device_id: i32,
}

/// File count and total size of an engine cache directory tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    files: u64,
    bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
    }

    stats
}

/// Logs a progress line every 15 s until dropped. TensorRT engine builds can
/// take minutes on a cold cache.
struct Heartbeat {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    const TICK: Duration = Duration::from_secs(15);

    fn start(what: &'static str) -> Self {
        let (stop, rx) = channel::<()>();
        let worker = thread::spawn(move || {
            let mut waited = Duration::ZERO;
            while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(Self::TICK) {
                waited += Self::TICK;
                info!(elapsed_secs = waited.as_secs(), "{what} still in progress");
            }
        });
        Self {
            stop: Some(stop),
            worker: Some(worker),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn commit(builder: SessionBuilder, model_path: &Path) -> anyhow::Result<Session> {
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
}

/// Build an `ort::Session` for the requested execution provider.
///
/// `Tensorrt` registers the TRT EP with engine caching and CUDA EP behind it.
/// `Cuda` registers CUDA EP only and `Cpu` registers nothing.
pub fn build_session(config: &SessionConfig<'_>) -> anyhow::Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match config.backend {
        InferenceBackend::Tensorrt => build_tensorrt_session(builder, config),
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(device_id = config.device_id, "Building session with CUDA EP");
            let builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build()
                .error_on_failure()])?;
            commit(builder, config.model_path)
        }
        InferenceBackend::Cpu => {
            debug!("Building session on CPU");
            commit(builder, config.model_path)
        }
    }
}

fn build_tensorrt_session(
    builder: SessionBuilder,
    config: &SessionConfig<'_>,
) -> anyhow::Result<Session> {
    let cache_dir = config.trt_cache_dir.unwrap_or(Path::new("trt_cache"));
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
    }

    let before = cache_stats(cache_dir);
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.files,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let started = Instant::now();
    let heartbeat = Heartbeat::start("TensorRT session initialization");
    let cache_path = cache_dir.to_string_lossy().to_string();
    let result = builder
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(&cache_path)
                .with_fp16(true)
                .with_device_id(config.device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
        ])
        .map_err(anyhow::Error::from)
        .and_then(|builder| commit(builder, config.model_path));
    drop(heartbeat);

    let elapsed_secs = started.elapsed().as_secs_f64();
    match result {
        Ok(session) => {
            let after = cache_stats(cache_dir);
            info!(
                elapsed_secs,
                cache_updated = after != before,
                cache_files = after.files,
                cache_bytes = after.bytes,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(err) => {
            error!(elapsed_secs, cache_dir = %cache_dir.display(), error = %err, "TensorRT session initialization failed");
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
    pub device_id: i32,
    pub bindings: ModelBindings,
    pub use_iobinding: bool,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            backend: InferenceBackend::default(),
            trt_cache_dir: None,
            device_id: 0,
            bindings: ModelBindings::default(),
            use_iobinding: true,
        }
    }
}

/// Check that every configured tensor name exists on the model.
pub fn validate_bindings(
    bindings: &ModelBindings,
    inputs: &[String],
    outputs: &[String],
) -> anyhow::Result<()> {
    let mut required = vec![&bindings.input0, &bindings.input1];
    required.extend(bindings.timestep.as_ref());
    for name in required {
        if !inputs.iter().any(|i| i == name) {
            bail!("model has no input named {name:?} (inputs: {inputs:?})");
        }
    }
    if !outputs.iter().any(|o| o == &bindings.output) {
        bail!(
            "model has no output named {:?} (outputs: {outputs:?})",
            bindings.output
        );
    }
    Ok(())
}

pub struct OrtEngine {
    session: Mutex<Session>,
    bindings: ModelBindings,
    name: String,
    fp16_io: bool,
    use_iobinding: bool,
}

impl OrtEngine {
    pub fn load(config: &EngineConfig) -> Result<Self> {
        Self::load_inner(config).map_err(|e| PipelineError::ModelLoad(e.into()))
    }

    fn load_inner(config: &EngineConfig) -> anyhow::Result<Self> {
        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            use_iobinding = config.use_iobinding,
            "Loading ONNX interpolation model"
        );

        let session = build_session(&SessionConfig {
            model_path: &config.model_path,
            backend: config.backend,
            trt_cache_dir: config.trt_cache_dir.as_deref(),
            device_id: config.device_id,
        })?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        validate_bindings(&config.bindings, &inputs, &outputs)?;

        let fp16_io = session
            .inputs()
            .iter()
            .find(|i| i.name() == config.bindings.input0)
            .map(|i| match i.dtype() {
                ort::value::ValueType::Tensor { ty, .. } => {
                    *ty == ort::tensor::TensorElementType::Float16
                }
                _ => false,
            })
            .unwrap_or(false);

        debug!(?inputs, ?outputs, fp16_io, "Detected model IO");

        let name = config
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self {
            session: Mutex::new(session),
            bindings: config.bindings.clone(),
            name,
            fp16_io,
            use_iobinding: config.use_iobinding,
        })
    }

    fn run_f32(
        &self,
        session: &mut Session,
        input0: Array4<f32>,
        input1: Array4<f32>,
        timestep: Option<Array4<f32>>,
    ) -> anyhow::Result<ArrayD<f32>> {
        let b = &self.bindings;
        let tensor0 = Tensor::from_array(input0)?;
        let tensor1 = Tensor::from_array(input1)?;
        let ts_tensor = timestep.map(|ts| Tensor::from_array(ts)).transpose()?;

        if self.use_iobinding {
            let mut binding = session.create_binding()?;
            binding.bind_input(&b.input0, &tensor0)?;
            binding.bind_input(&b.input1, &tensor1)?;
            if let (Some(name), Some(ts)) = (&b.timestep, &ts_tensor) {
                binding.bind_input(name, ts)?;
            }
            binding.bind_output_to_device(&b.output, &session.allocator().memory_info())?;
            let outputs = session.run_binding(&binding)?;
            let output_view = outputs[b.output.as_str()].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        } else {
            let outputs = match (&b.timestep, &ts_tensor) {
                (Some(name), Some(ts)) => session.run(ort::inputs![
                    b.input0.as_str() => &tensor0,
                    b.input1.as_str() => &tensor1,
                    name.as_str() => ts
                ])?,
                _ => session.run(ort::inputs![
                    b.input0.as_str() => &tensor0,
                    b.input1.as_str() => &tensor1
                ])?,
            };
            let output_view = outputs[b.output.as_str()].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        }
    }

    fn run_f16(
        &self,
        session: &mut Session,
        input0: Array4<f32>,
        input1: Array4<f32>,
        timestep: Option<Array4<f32>>,
    ) -> anyhow::Result<ArrayD<f32>> {
        let b = &self.bindings;
        let tensor0 = Tensor::from_array(input0.mapv(f16::from_f32))?;
        let tensor1 = Tensor::from_array(input1.mapv(f16::from_f32))?;
        let ts_tensor = timestep.map(|ts| Tensor::from_array(ts)).transpose()?;

        let mut binding = session.create_binding()?;
        binding.bind_input(&b.input0, &tensor0)?;
        binding.bind_input(&b.input1, &tensor1)?;
        if let (Some(name), Some(ts)) = (&b.timestep, &ts_tensor) {
            binding.bind_input(name, ts)?;
        }
        binding.bind_output_to_device(&b.output, &session.allocator().memory_info())?;
        let outputs = session.run_binding(&binding)?;
        let output_view = outputs[b.output.as_str()].try_extract_array::<f16>()?;
        Ok(output_view.mapv(f16::to_f32))
    }
}

impl InferenceEngine for OrtEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self) -> &ModelBindings {
        &self.bindings
    }

    fn run(
        &self,
        input0: ArrayView3<'_, f32>,
        input1: ArrayView3<'_, f32>,
        timestep: f32,
    ) -> anyhow::Result<Array3<f32>> {
        let started = Instant::now();
        let batch0 = input0.insert_axis(Axis(0)).to_owned();
        let batch1 = input1.insert_axis(Axis(0)).to_owned();
        let ts = self
            .bindings
            .timestep
            .as_ref()
            .map(|_| Array4::<f32>::from_elem((1, 1, 1, 1), timestep));

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        let output = if self.fp16_io {
            self.run_f16(&mut session, batch0, batch1, ts)?
        } else {
            self.run_f32(&mut session, batch0, batch1, ts)?
        };
        drop(session);

        let output = output
            .into_dimensionality::<Ix4>()
            .context("model output is not a 4-D tensor")?;
        if output.shape()[0] != 1 {
            bail!("model returned batch of {}", output.shape()[0]);
        }

        debug!(
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            timestep,
            "ONNX tile inference"
        );
        Ok(output.index_axis_move(Axis(0), 0))
    }
}
