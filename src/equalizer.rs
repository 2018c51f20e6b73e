// equalizer.rs — Top-level image equalization.
//
// FLOW
// ────
//   Image ──split──► luminance ──DeviceBufferSet::allocate──► buffers
//                        │
//                        └──StagePipeline::run──► output plane + tables
//                                                       │
//   Image ◄──assemble── output plane + chroma ◄─────────┘
//
// `Equalizer` owns the backend, so the device context and the compiled
// kernels are created once and reused for every image handed to it.
// Buffers are sized per image and released when `equalize` returns.

use log::{debug, info, warn};

use crate::assemble::assemble;
use crate::backend::ComputeBackend;
use crate::buffers::DeviceBufferSet;
use crate::color::split;
use crate::error::Result;
use crate::histeq::{CumulativeHistogram, Histogram, Lut, BIN_COUNT};
use crate::image::Image;
use crate::pipeline::{PipelineOutput, StagePipeline};
use crate::profiling::ProfilingReport;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-run reporting options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqualizerConfig {
    /// Dump histogram, cumulative histogram and LUT at `info` level.
    pub log_histograms: bool,
    /// Emit per-stage timing lines at `info` level.
    pub report_timings: bool,
}

impl Default for EqualizerConfig {
    fn default() -> Self {
        EqualizerConfig { log_histograms: false, report_timings: true }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// The equalized image plus the diagnostics gathered on the way.
#[derive(Debug, Clone)]
pub struct Equalized {
    pub image: Image,
    pub histogram: Option<Histogram>,
    pub cumulative: Option<CumulativeHistogram>,
    pub lut: Option<Lut>,
    pub profile: ProfilingReport,
}

// ---------------------------------------------------------------------------
// Equalizer
// ---------------------------------------------------------------------------

pub struct Equalizer<B: ComputeBackend> {
    backend: B,
    pipeline: StagePipeline,
    config: EqualizerConfig,
}

impl<B: ComputeBackend> Equalizer<B> {
    /// Standard four-stage pipeline, default config.
    pub fn new(backend: B) -> Self {
        Self::with_pipeline(backend, StagePipeline::standard(), EqualizerConfig::default())
    }

    pub fn with_config(backend: B, config: EqualizerConfig) -> Self {
        Self::with_pipeline(backend, StagePipeline::standard(), config)
    }

    pub fn with_pipeline(backend: B, pipeline: StagePipeline, config: EqualizerConfig) -> Self {
        if config.report_timings && !backend.supports_profiling() {
            warn!("{}: kernel timestamps unavailable, reporting transfer times only", backend.name());
        }
        Equalizer { backend, pipeline, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EqualizerConfig {
        &self.config
    }

    /// Equalize one image. Colour images are equalized on luminance.
    pub fn equalize(&self, image: Image) -> Result<Equalized> {
        let split = split(image);
        debug!(
            "equalize: {} image ({}), backend {}",
            if split.is_color() { "colour" } else { "grayscale" },
            split.shape,
            self.backend.name()
        );

        let buffers = DeviceBufferSet::allocate(&self.backend, split.luminance.byte_size(), BIN_COUNT)?;
        let run = self.pipeline.run(&self.backend, &buffers, &split.luminance)?;
        drop(buffers);

        let mut profile = ProfilingReport::new();
        for (label, timing) in &run.timings {
            profile.record(*label, *timing);
        }
        if self.config.report_timings {
            profile.log();
        }

        if self.config.log_histograms {
            // requested explicitly, so shown at the default filter level
            for line in table_dump(&run) {
                info!("{line}");
            }
        }

        let image = assemble(run.output, split.chroma, split.shape)?;
        Ok(Equalized {
            image,
            histogram: run.histogram,
            cumulative: run.cumulative,
            lut: run.lut,
            profile,
        })
    }
}

/// One line per diagnostic table the run read back.
fn table_dump(run: &PipelineOutput) -> Vec<String> {
    let mut lines = Vec::with_capacity(3);
    if let Some(h) = &run.histogram {
        lines.push(format!("histogram: {h:?}"));
    }
    if let Some(c) = &run.cumulative {
        lines.push(format!("cumulative: {c:?}"));
    }
    if let Some(l) = &run.lut {
        lines.push(format!("lut: {l:?}"));
    }
    lines
}
