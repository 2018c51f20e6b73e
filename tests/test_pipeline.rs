// tests/test_pipeline.rs — The full four-stage chain through the public API.
//
// Runs on `CpuBackend`, which is always available and follows the device
// buffer contract. GPU parity is covered by the ignored tests in
// `gpu::backend`.

use gpu_histeq::backend::{BufferRole, Kernel};
use gpu_histeq::buffers::DeviceBufferSet;
use gpu_histeq::histeq::{compute_histogram, equalize_plane, BIN_COUNT};
use gpu_histeq::image::{Image, Plane};
use gpu_histeq::pipeline::{Domain, StageDescriptor, StagePipeline, STANDARD_STAGES};
use gpu_histeq::{CpuBackend, Equalizer, EqualizerConfig, HistEqError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn textured_plane(w: usize, h: usize) -> Plane {
    let data = (0..w * h).map(|i| (((i % w) * 3 + (i / w) * 5) % 120 + 40) as u8).collect();
    Plane::from_vec(w, h, data)
}

// ===== Grayscale =====

#[test]
fn pipeline_matches_host_reference() {
    init_logging();
    let backend = CpuBackend::new();
    for (w, h) in [(1, 1), (2, 2), (7, 3), (64, 64), (129, 77)] {
        let plane = textured_plane(w, h);
        let buffers = DeviceBufferSet::allocate(&backend, plane.byte_size(), BIN_COUNT).unwrap();
        let out = StagePipeline::standard().run(&backend, &buffers, &plane).unwrap();
        assert_eq!(out.output, equalize_plane(&plane), "{w}x{h}");
        assert_eq!(out.histogram.as_ref(), Some(&compute_histogram(&plane)));
    }
}

#[test]
fn strided_plane_is_compacted_before_upload() {
    let mut strided = Plane::new_with_stride(5, 3, 8);
    for y in 0..3 {
        for x in 0..5 {
            strided.set(x, y, (x * 40 + y * 10) as u8);
        }
    }
    let packed = Plane::from_vec(5, 3, strided.to_contiguous());

    let eq = Equalizer::new(CpuBackend::new());
    let a = eq.equalize(Image::gray(strided)).unwrap();
    let b = eq.equalize(Image::gray(packed)).unwrap();
    assert_eq!(a.image.plane(0).to_contiguous(), b.image.plane(0).to_contiguous());
}

#[test]
fn all_black_scenario() {
    let eq = Equalizer::new(CpuBackend::new());
    let out = eq.equalize(Image::gray(Plane::filled(4, 4, 0))).unwrap();

    let hist = out.histogram.unwrap();
    assert_eq!(hist.counts()[0], 16);
    assert_eq!(hist.total(), 16);
    assert!(out.cumulative.unwrap().values().iter().all(|&c| c == 16));
    assert!(out.lut.unwrap().table().iter().all(|&v| v == 255));
    assert!(out.image.plane(0).pixels().all(|v| v == 255));
}

#[test]
fn four_level_scenario() {
    let eq = Equalizer::new(CpuBackend::new());
    let out = eq.equalize(Image::gray(Plane::from_vec(2, 2, vec![0, 85, 170, 255]))).unwrap();
    let cdf = out.cumulative.unwrap();
    assert_eq!([cdf.values()[0], cdf.values()[85], cdf.values()[170], cdf.values()[255]], [1, 2, 3, 4]);
    assert_eq!(out.lut.unwrap().get(255), 255);
    assert_eq!(out.image.plane(0).to_contiguous(), vec![64, 128, 191, 255]);
}

// ===== Colour =====

#[test]
fn colour_image_equalizes_luminance_only() {
    // neutral grays: chroma stays centred, so RGB equals the equalized luma
    let levels = [30u8, 30, 60, 60, 90, 90, 120, 120];
    let data: Vec<u8> = levels.iter().flat_map(|&v| [v, v, v]).collect();
    let img = Image::from_interleaved(4, 2, 3, &data).unwrap();

    let out = Equalizer::new(CpuBackend::new()).equalize(img).unwrap();
    assert!(out.image.is_color());
    let expected = equalize_plane(&Plane::from_vec(4, 2, levels.to_vec()));
    for c in 0..3 {
        for (a, b) in out.image.plane(c).pixels().zip(expected.pixels()) {
            assert!((a as i16 - b as i16).abs() <= 1, "channel {c}: {a} vs {b}");
        }
    }
}

// ===== Batch reuse =====

#[test]
fn one_equalizer_many_images() {
    let backend = CpuBackend::new();
    let eq = Equalizer::with_config(backend, EqualizerConfig { log_histograms: true, report_timings: false });
    for n in 1..5 {
        let plane = textured_plane(10 * n, 7 * n);
        let out = eq.equalize(Image::gray(plane.clone())).unwrap();
        assert_eq!(out.image.plane(0), &equalize_plane(&plane));
    }
    // buffers are released after every image
    assert_eq!(eq.backend().allocated_bytes(), 0);
}

// ===== Profiling =====

#[test]
fn profile_has_one_entry_per_stage() {
    let out = Equalizer::new(CpuBackend::new()).equalize(Image::gray(textured_plane(32, 32))).unwrap();
    let labels: Vec<&str> = out.profile.stages().iter().map(|(l, _)| l.as_str()).collect();
    assert_eq!(labels, ["histogram", "cumulative histogram", "LUT", "back-projection"]);
    assert!(out.profile.total_execution().is_some());
    assert!(out.profile.to_string().contains("back-projection kernel execution time [us]"));
}

#[test]
fn profiling_off_reports_transfers_only() {
    let backend = CpuBackend::new().with_profiling(false);
    let out = Equalizer::new(backend).equalize(Image::gray(textured_plane(8, 8))).unwrap();
    assert!(out.profile.stages().iter().all(|(_, t)| t.execution.is_none()));
    assert!(out.profile.total_execution().is_none());
    assert!(!out.profile.to_string().contains("kernel execution time"));
}

// ===== Failures =====

#[test]
fn allocation_failure_aborts_before_any_stage() {
    let backend = CpuBackend::new().with_memory_limit(1024);
    let err = Equalizer::new(backend).equalize(Image::gray(textured_plane(64, 64))).unwrap_err();
    assert!(matches!(err, HistEqError::Allocation { .. }), "{err}");
}

#[test]
fn raw_histogram_into_normalize_is_caught_at_readback() {
    // normalizing the raw histogram instead of the cumulative one gives a
    // non-monotonic table; the LUT stage's readback check rejects it
    let stages = vec![
        STANDARD_STAGES[0],
        StageDescriptor {
            label: "LUT",
            kernel: Kernel::Normalize,
            inputs: &[BufferRole::Histogram],
            output: BufferRole::Lut,
            domain: Domain::Bins,
            zero_output: true,
        },
        STANDARD_STAGES[3],
    ];
    let pipeline = StagePipeline::new(stages).unwrap();
    let eq = Equalizer::with_pipeline(CpuBackend::new(), pipeline, EqualizerConfig::default());
    let err = eq.equalize(Image::gray(Plane::from_vec(2, 2, vec![0, 85, 170, 255]))).unwrap_err();
    match err {
        HistEqError::Launch { stage, .. } => assert_eq!(stage, "LUT"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn narrow_bin_count_fails_instead_of_panicking() {
    let backend = CpuBackend::new();
    let err = DeviceBufferSet::allocate(&backend, 4, 16).err().expect("16 bins must be refused");
    assert!(matches!(err, HistEqError::Allocation { role: BufferRole::Histogram, .. }), "{err}");
}
