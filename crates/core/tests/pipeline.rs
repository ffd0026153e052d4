use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::bail;
use ndarray::{Array3, ArrayView3};
use tilerp_core::{
    device::{ComputeBackend, ElementType, HostBackend},
    engine::{InferenceEngine, ModelBindings},
    error::{ErrorClass, PipelineError},
    layout::PixelLayout,
    normalize::Normalization,
    pipeline::{InterpolationPipeline, PipelineOptions, PipelineState, SyncPolicy},
    tiling::{TilePolicy, TileSpec},
    types::Frame,
};

#[derive(Clone, Copy)]
enum Behavior {
    /// 5x5 box blur of the average of both inputs.
    Blur,
    /// Return the first input unchanged.
    Identity,
    /// Average both inputs.
    Average,
    Fail,
    /// Return a tensor one column narrower than the inputs.
    WrongShape,
}

struct StubEngine {
    behavior: Behavior,
    bindings: ModelBindings,
    calls: AtomicUsize,
    timesteps: Mutex<Vec<f32>>,
}

impl StubEngine {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            bindings: ModelBindings::default(),
            calls: AtomicUsize::new(0),
            timesteps: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timesteps
            .lock()
            .expect("timestep log lock")
            .push(timestep);
        match self.behavior {
            Behavior::Identity => Ok(input0.to_owned()),
            Behavior::Average => Ok((&input0 + &input1) * 0.5f32),
            Behavior::Blur => Ok(box_blur(&((&input0 + &input1) * 0.5f32), 2)),
            Behavior::Fail => bail!("device lost"),
            Behavior::WrongShape => {
                let (c, h, w) = input0.dim();
                Ok(Array3::zeros((c, h, w.saturating_sub(1))))
            }
        }
    }
}

fn box_blur(input: &Array3<f32>, radius: usize) -> Array3<f32> {
    let (channels, height, width) = input.dim();
    let mut out = Array3::zeros((channels, height, width));
    for c in 0..channels {
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0f32;
                let mut count = 0.0f32;
                for sy in y.saturating_sub(radius)..(y + radius + 1).min(height) {
                    for sx in x.saturating_sub(radius)..(x + radius + 1).min(width) {
                        sum += input[[c, sy, sx]];
                        count += 1.0;
                    }
                }
                out[[c, y, x]] = sum / count;
            }
        }
    }
    out
}

/// Engine that reads device counters from inside `run`.
struct CounterReadingEngine {
    host: Arc<HostBackend>,
    bindings: ModelBindings,
    seen: Mutex<Vec<u64>>,
}

impl InferenceEngine for CounterReadingEngine {
    fn name(&self) -> &str {
        "counter-reading"
    }

    fn bindings(&self) -> &ModelBindings {
        &self.bindings
    }

    fn run(
        &self,
        input0: ArrayView3<'_, f32>,
        _input1: ArrayView3<'_, f32>,
        _timestep: f32,
    ) -> anyhow::Result<Array3<f32>> {
        let inferences = self.host.stats().inferences;
        self.seen.lock().expect("counter log lock").push(inferences);
        Ok(input0.to_owned())
    }
}

struct Harness {
    host: Arc<HostBackend>,
    engine: Arc<StubEngine>,
    pipeline: InterpolationPipeline,
}

fn harness_on(host: HostBackend, behavior: Behavior, options: PipelineOptions) -> Harness {
    let host = Arc::new(host);
    let engine = StubEngine::new(behavior);
    let backend: Arc<dyn ComputeBackend> = host.clone();
    let pipeline = InterpolationPipeline::load(backend, engine.clone(), options)
        .expect("pipeline should load");
    Harness {
        host,
        engine,
        pipeline,
    }
}

fn harness(behavior: Behavior, options: PipelineOptions) -> Harness {
    harness_on(HostBackend::new(), behavior, options)
}

fn options(tiling: TilePolicy, storage: ElementType) -> PipelineOptions {
    PipelineOptions {
        tiling,
        normalization: Normalization::MeanCentered,
        storage,
        layout: PixelLayout::Rgb,
    }
}

fn gradient(width: u32, height: u32, seed: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            for c in 0..3u32 {
                data.push(((x * 7 + y * 13 + c * 29 + seed) % 256) as u8);
            }
        }
    }
    Frame::new(width, height, PixelLayout::Rgb, data).expect("valid gradient frame")
}

fn run(harness: &mut Harness, f0: &Frame, f1: &Frame, factor: f32) -> Frame {
    let mut out = Frame::blank(f0.width(), f0.height(), PixelLayout::Rgb);
    harness
        .pipeline
        .process(f0, f1, factor, &mut out)
        .expect("frame should interpolate");
    out
}

#[test]
fn test_identical_frames_round_trip_bit_exact() {
    let policies = [
        ("untiled", TilePolicy::untiled()),
        ("small tiles", TilePolicy::fixed(TileSpec::SMALL)),
        ("large tiles", TilePolicy::fixed(TileSpec::LARGE)),
    ];
    for (label, policy) in policies {
        for storage in [ElementType::F16, ElementType::F32] {
            let mut h = harness(Behavior::Identity, options(policy, storage));
            let frame = gradient(300, 300, 0);
            let out = run(&mut h, &frame, &frame, 0.5);
            assert!(
                out.data() == frame.data(),
                "{label} with {storage:?} storage changed pixel values"
            );
        }
    }
}

#[test]
fn test_raw_normalization_round_trips() {
    let opts = PipelineOptions {
        normalization: Normalization::Raw,
        ..options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16)
    };
    let mut h = harness(Behavior::Identity, opts);
    let frame = gradient(170, 90, 5);
    let out = run(&mut h, &frame, &frame, 0.25);
    assert_eq!(out.data(), frame.data());
}

#[test]
fn test_odd_sizes_are_padded_and_cropped() {
    for (w, h_) in [(1, 1), (33, 17), (257, 31), (513, 260)] {
        let mut h = harness(
            Behavior::Identity,
            options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F32),
        );
        let frame = gradient(w, h_, 11);
        let out = run(&mut h, &frame, &frame, 0.5);
        assert!(out.data() == frame.data(), "{w}x{h_} did not round trip");
    }
}

#[test]
fn test_averaging_engine_blends_two_frames() {
    let mut h = harness(
        Behavior::Average,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F32),
    );
    let f0 = Frame::filled(300, 200, PixelLayout::Rgb, [10, 100, 200]);
    let f1 = Frame::filled(300, 200, PixelLayout::Rgb, [30, 140, 250]);
    let out = run(&mut h, &f0, &f1, 0.5);

    for (y, x) in [(0, 0), (199, 299), (100, 256), (57, 3)] {
        let px = out.pixel(x, y);
        for (got, want) in px.iter().zip([20u8, 120, 225]) {
            assert!(got.abs_diff(want) <= 1, "pixel ({x}, {y}) = {px:?}");
        }
    }
}

#[test]
fn test_factor_bounds_copy_inputs_without_device_work() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    let f0 = gradient(64, 48, 1);
    let f1 = gradient(64, 48, 2);

    let mut out = Frame::blank(64, 48, PixelLayout::Rgb);
    let report = h
        .pipeline
        .process(&f0, &f1, 0.0, &mut out)
        .expect("factor 0");
    assert!(report.shortcut);
    assert_eq!(out.data(), f0.data());

    h.pipeline
        .process(&f0, &f1, 1.0, &mut out)
        .expect("factor 1");
    assert_eq!(out.data(), f1.data());

    let stats = h.host.stats();
    assert_eq!(stats.submits, 0);
    assert_eq!(stats.uploads, 0);
    assert_eq!(h.engine.calls(), 0);
}

#[test]
fn test_untiled_frame_uses_one_inference_and_one_submit() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::untiled(), ElementType::F16),
    );
    let frame = gradient(100, 100, 3);
    let mut out = Frame::blank(100, 100, PixelLayout::Rgb);
    let report = h
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");

    assert_eq!(report.tiles, 1);
    assert_eq!(report.sync, Some(SyncPolicy::Batched));
    assert_eq!(report.barriers, 1);
    let stats = h.host.stats();
    assert_eq!(stats.submits, 1);
    assert_eq!(stats.inferences, 1);
    assert_eq!(h.engine.calls(), 1);
}

#[test]
fn test_multi_column_grid_synchronizes_per_tile() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    let frame = gradient(300, 300, 4);
    let mut out = Frame::blank(300, 300, PixelLayout::Rgb);
    let report = h
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");

    assert_eq!((report.xtiles, report.ytiles), (2, 2));
    assert_eq!(report.sync, Some(SyncPolicy::PerTile));
    assert!(report.barriers as usize >= report.tiles);
    let stats = h.host.stats();
    assert_eq!(stats.submits, report.barriers as u64);
    assert_eq!(stats.inferences, 4);
}

#[test]
fn test_single_column_grid_batches_tile_rows() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    let frame = gradient(200, 600, 6);
    let mut out = Frame::blank(200, 600, PixelLayout::Rgb);
    let report = h
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");

    assert_eq!((report.xtiles, report.ytiles), (1, 3));
    assert_eq!(report.sync, Some(SyncPolicy::Batched));
    assert_eq!(report.barriers, 3);
    assert_eq!(out.data(), frame.data());
}

#[test]
fn test_timestep_reaches_the_engine() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F32),
    );
    let frame = gradient(300, 100, 0);
    run(&mut h, &frame, &frame, 0.25);
    let seen = h.engine.timesteps.lock().expect("timestep log lock").clone();
    assert_eq!(seen, vec![0.25, 0.25]);
}

#[test]
fn test_tiling_lowers_peak_device_memory() {
    let frame = gradient(1024, 768, 9);

    let mut untiled = harness(
        Behavior::Identity,
        options(TilePolicy::untiled(), ElementType::F16),
    );
    run(&mut untiled, &frame, &frame, 0.5);

    let mut tiled = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    run(&mut tiled, &frame, &frame, 0.5);

    let untiled_peak = untiled.host.stats().peak_bytes;
    let tiled_peak = tiled.host.stats().peak_bytes;
    assert!(
        tiled_peak < untiled_peak,
        "tiled peak {tiled_peak} should be below untiled peak {untiled_peak}"
    );
    assert_eq!(tiled.host.stats().live_bytes, 0);
}

#[test]
fn test_engine_failure_aborts_frame_and_keeps_output() {
    let mut h = harness(
        Behavior::Fail,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    let frame = gradient(300, 300, 2);
    let mut out = Frame::filled(300, 300, PixelLayout::Rgb, [7, 7, 7]);
    let err = h
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect_err("engine failure must abort");

    assert!(matches!(err, PipelineError::Inference { xi: 0, yi: 0, .. }));
    assert_eq!(err.class(), ErrorClass::Backend);
    assert!(out.data().iter().all(|&b| b == 7));
    assert_eq!(h.pipeline.state(), PipelineState::Ready);
    assert_eq!(h.host.stats().live_bytes, 0);
    assert_eq!(h.host.stats().live_allocators, 0);
}

#[test]
fn test_pipeline_recovers_after_failed_frame() {
    let mut h = harness_on(
        HostBackend::new().with_memory_limit(4 * 1024 * 1024),
        Behavior::Identity,
        options(TilePolicy::untiled(), ElementType::F32),
    );
    let big = gradient(1024, 1024, 0);
    let mut big_out = Frame::blank(1024, 1024, PixelLayout::Rgb);
    let err = h
        .pipeline
        .process(&big, &big, 0.5, &mut big_out)
        .expect_err("allocation should exceed the limit");
    assert!(matches!(err, PipelineError::Allocation { .. }));

    let small = gradient(64, 64, 1);
    let out = run(&mut h, &small, &small, 0.5);
    assert_eq!(out.data(), small.data());
}

#[test]
fn test_wrong_shape_output_is_a_contract_violation() {
    let mut h = harness(
        Behavior::WrongShape,
        options(TilePolicy::untiled(), ElementType::F32),
    );
    let frame = gradient(64, 64, 0);
    let mut out = Frame::blank(64, 64, PixelLayout::Rgb);
    let err = h
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect_err("shape mismatch must fail");
    assert_eq!(err.class(), ErrorClass::Contract);
}

#[test]
fn test_mismatched_frames_are_rejected_before_device_work() {
    let mut h = harness(
        Behavior::Identity,
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F16),
    );
    let f0 = gradient(64, 64, 0);
    let f1 = gradient(64, 32, 0);
    let mut out = Frame::blank(64, 64, PixelLayout::Rgb);

    let err = h
        .pipeline
        .process(&f0, &f1, 0.5, &mut out)
        .expect_err("dimension mismatch");
    assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::Configuration);

    let mut small_out = Frame::blank(32, 32, PixelLayout::Rgb);
    let err = h
        .pipeline
        .process(&f0, &f0, 0.5, &mut small_out)
        .expect_err("output mismatch");
    assert!(matches!(err, PipelineError::OutputMismatch { .. }));

    let bgr = Frame::blank(64, 64, PixelLayout::Bgr);
    let err = h
        .pipeline
        .process(&bgr, &bgr, 0.5, &mut out)
        .expect_err("layout mismatch");
    assert!(matches!(err, PipelineError::LayoutMismatch { .. }));

    assert_eq!(h.host.stats().submits, 0);
}

#[test]
fn test_automatic_tiling_follows_heap_budget() {
    let frame = gradient(600, 600, 0);

    let mut roomy = harness_on(
        HostBackend::new().with_heap_budget(1 << 30),
        Behavior::Identity,
        options(TilePolicy::auto(1536), ElementType::F16),
    );
    let mut out = Frame::blank(600, 600, PixelLayout::Rgb);
    let report = roomy
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");
    assert_eq!(report.spec, Some(TileSpec::UNTILED));

    let mut tight = harness_on(
        HostBackend::new().with_heap_budget(200 * 1024 * 1024),
        Behavior::Identity,
        options(TilePolicy::auto(1536), ElementType::F16),
    );
    let report = tight
        .pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");
    assert_eq!(report.spec, Some(TileSpec::SMALL));
    assert_eq!(out.data(), frame.data());
}

#[test]
fn test_dropping_pipeline_releases_device_pipelines() {
    let h = harness(
        Behavior::Identity,
        options(TilePolicy::untiled(), ElementType::F16),
    );
    assert_eq!(h.host.stats().live_pipelines, 2);
    let host = Arc::clone(&h.host);
    drop(h);
    assert_eq!(host.stats().live_pipelines, 0);
}

#[test]
fn test_tile_seams_match_untiled_output() {
    let f0 = gradient(600, 400, 17);
    let f1 = gradient(600, 400, 90);

    for normalization in [Normalization::MeanCentered, Normalization::Raw] {
        let untiled_options = PipelineOptions {
            normalization,
            ..options(TilePolicy::untiled(), ElementType::F32)
        };
        let mut untiled = harness(Behavior::Blur, untiled_options);
        let reference = run(&mut untiled, &f0, &f1, 0.5);

        let tiled_options = PipelineOptions {
            normalization,
            ..options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F32)
        };
        let mut tiled = harness(Behavior::Blur, tiled_options);
        let mut out = Frame::blank(600, 400, PixelLayout::Rgb);
        let report = tiled
            .pipeline
            .process(&f0, &f1, 0.5, &mut out)
            .expect("tiled frame");
        assert_eq!((report.xtiles, report.ytiles), (3, 2));

        let differing = out
            .data()
            .iter()
            .zip(reference.data())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(
            differing, 0,
            "{normalization:?}: tiled output differs from untiled in {differing} bytes"
        );
    }
}

#[test]
fn test_engine_can_query_backend_while_running() {
    let host = Arc::new(HostBackend::new());
    let engine = Arc::new(CounterReadingEngine {
        host: Arc::clone(&host),
        bindings: ModelBindings::default(),
        seen: Mutex::new(Vec::new()),
    });
    let backend: Arc<dyn ComputeBackend> = host.clone();
    let mut pipeline = InterpolationPipeline::load(
        backend,
        engine.clone(),
        options(TilePolicy::fixed(TileSpec::SMALL), ElementType::F32),
    )
    .expect("pipeline should load");

    let frame = gradient(300, 100, 0);
    let mut out = Frame::blank(300, 100, PixelLayout::Rgb);
    pipeline
        .process(&frame, &frame, 0.5, &mut out)
        .expect("process");

    assert_eq!(*engine.seen.lock().expect("counter log lock"), vec![1, 2]);
    assert_eq!(out.data(), frame.data());
}
