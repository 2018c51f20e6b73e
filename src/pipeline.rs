// pipeline.rs — The stage coordinator.
//
// Equalization is four dependent kernel launches over device-resident
// buffers:
//
//   input ──► [histogram] ──► histogram ──► [scan] ──► cumulative
//     │                                                    │
//     │                                              [normalize]
//     │                                                    ▼
//     └──────────────────► [backProject] ◄──────────────── LUT
//                                │
//                                ▼
//                              output
//
// The chain is data, not code: a table of `StageDescriptor`s naming the
// kernel, the buffer roles it reads, the role it writes, the domain it
// runs over, and whether its output must be zeroed first. `StagePipeline`
// validates the table once and then walks it for every plane.
//
// Stage-to-stage handoff stays on the device. The only host copies are
// the input upload, the diagnostic readback of each counter buffer (which
// is also where the host checks the stage's invariants), and the final
// output plane. The first error aborts the run; nothing is retried.

use std::collections::HashSet;
use std::time::Duration;

use log::debug;

use crate::backend::{BufferRole, ComputeBackend, Kernel, KernelLaunch, KernelParams};
use crate::buffers::DeviceBufferSet;
use crate::error::{HistEqError, Result};
use crate::histeq::{CumulativeHistogram, Histogram, Lut, BIN_COUNT};
use crate::image::Plane;
use crate::profiling::StageTiming;

// ---------------------------------------------------------------------------
// Stage descriptors
// ---------------------------------------------------------------------------

/// What a stage's work-items range over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// One work-item per pixel of the plane.
    Pixels,
    /// One work-item per histogram bin.
    Bins,
}

/// One kernel launch in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    /// Name used in logs, timings and errors.
    pub label: &'static str,
    pub kernel: Kernel,
    /// Buffers bound as kernel inputs, in binding order.
    pub inputs: &'static [BufferRole],
    pub output: BufferRole,
    pub domain: Domain,
    /// Fill the output with zero before launching.
    pub zero_output: bool,
}

/// The standard histogram → scan → normalize → back-projection chain.
pub const STANDARD_STAGES: [StageDescriptor; 4] = [
    StageDescriptor {
        label: "histogram",
        kernel: Kernel::Histogram,
        inputs: &[BufferRole::Input],
        output: BufferRole::Histogram,
        domain: Domain::Pixels,
        // atomics accumulate into the existing contents
        zero_output: true,
    },
    StageDescriptor {
        label: "cumulative histogram",
        kernel: Kernel::Scan,
        inputs: &[BufferRole::Histogram],
        output: BufferRole::Cumulative,
        domain: Domain::Bins,
        zero_output: true,
    },
    StageDescriptor {
        label: "LUT",
        kernel: Kernel::Normalize,
        inputs: &[BufferRole::Cumulative],
        output: BufferRole::Lut,
        domain: Domain::Bins,
        zero_output: true,
    },
    StageDescriptor {
        label: "back-projection",
        kernel: Kernel::BackProject,
        inputs: &[BufferRole::Input, BufferRole::Lut],
        output: BufferRole::Output,
        domain: Domain::Pixels,
        zero_output: false,
    },
];

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Everything one run produces on the host.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub output: Plane,
    /// Diagnostic copies of the counter buffers, for the stages that wrote
    /// them.
    pub histogram: Option<Histogram>,
    pub cumulative: Option<CumulativeHistogram>,
    pub lut: Option<Lut>,
    /// One entry per stage, in order.
    pub timings: Vec<(&'static str, StageTiming)>,
}

// ---------------------------------------------------------------------------
// StagePipeline
// ---------------------------------------------------------------------------

/// A validated, ordered list of stages.
#[derive(Debug, Clone)]
pub struct StagePipeline {
    stages: Vec<StageDescriptor>,
}

impl Default for StagePipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl StagePipeline {
    /// The standard four-stage chain.
    pub fn standard() -> Self {
        StagePipeline { stages: STANDARD_STAGES.to_vec() }
    }

    /// Validate a stage table.
    ///
    /// Every input must be the uploaded plane or the output of an earlier
    /// stage; no stage may read its own output or write the input plane;
    /// each buffer has at most one producer; the table must produce the
    /// output plane. Violations are reported before any device work.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self> {
        let mut produced: HashSet<BufferRole> = HashSet::from([BufferRole::Input]);

        for stage in &stages {
            let fail = |reason: String| Err(HistEqError::launch(stage.label, reason));

            if stage.inputs.len() != stage.kernel.arity() {
                return fail(format!(
                    "kernel `{}` takes {} input(s), stage binds {}",
                    stage.kernel,
                    stage.kernel.arity(),
                    stage.inputs.len()
                ));
            }
            if stage.inputs.contains(&stage.output) {
                return fail(format!("reads its own output buffer ({})", stage.output));
            }
            if let Some(missing) = stage.inputs.iter().find(|r| !produced.contains(*r)) {
                return fail(format!("reads the {missing} buffer before any stage writes it"));
            }
            if stage.output == BufferRole::Input {
                return fail("writes the read-only input buffer".to_string());
            }
            if !produced.insert(stage.output) {
                return fail(format!("{} buffer already has a producer", stage.output));
            }
        }

        if !produced.contains(&BufferRole::Output) {
            return Err(HistEqError::launch("pipeline", "no stage writes the output buffer"));
        }
        Ok(StagePipeline { stages })
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Upload `plane`, run every stage in order and read back the results.
    ///
    /// `buffers` must have been allocated for this plane's byte size.
    pub fn run<B: ComputeBackend>(
        &self,
        backend: &B,
        buffers: &DeviceBufferSet<B>,
        plane: &Plane,
    ) -> Result<PipelineOutput> {
        let pixel_count = plane.pixel_count();
        if pixel_count == 0 {
            return Err(HistEqError::launch("upload", "plane has no pixels"));
        }
        let pixel_count_u32 = u32::try_from(pixel_count)
            .map_err(|_| HistEqError::launch("upload", format!("{pixel_count} pixels exceed the u32 domain")))?;
        let params = KernelParams { pixel_count: pixel_count_u32, bin_count: buffers.bin_count() as u32 };

        let upload = buffers.upload_plane(backend, plane)?;
        debug!("pipeline: uploaded {}x{} plane in {upload:?}", plane.width(), plane.height());

        let mut result = PipelineOutput {
            output: Plane::new(0, 0),
            histogram: None,
            cumulative: None,
            lut: None,
            timings: Vec::with_capacity(self.stages.len()),
        };

        for (i, stage) in self.stages.iter().enumerate() {
            let mut transfer = if i == 0 { upload } else { Duration::ZERO };

            if stage.zero_output {
                transfer += buffers.zero(backend, stage.output)?;
            }

            let domain = match stage.domain {
                Domain::Pixels => params.pixel_count,
                Domain::Bins => params.bin_count,
            };
            debug!("pipeline: stage {} `{}` over {domain} work-items", i + 1, stage.kernel);

            let launch = KernelLaunch {
                kernel: stage.kernel,
                inputs: stage.inputs.iter().map(|&r| buffers.buffer(r)).collect(),
                output: buffers.buffer(stage.output),
                domain,
                params,
            };
            let execution = backend.launch(&launch)?;

            transfer += self.read_back(backend, buffers, stage, plane, &mut result)?;
            result.timings.push((stage.label, StageTiming { transfer, execution }));
        }

        Ok(result)
    }

    /// Pull a stage's output to the host and check its invariants.
    fn read_back<B: ComputeBackend>(
        &self,
        backend: &B,
        buffers: &DeviceBufferSet<B>,
        stage: &StageDescriptor,
        plane: &Plane,
        result: &mut PipelineOutput,
    ) -> Result<Duration> {
        let pixel_count = plane.pixel_count();
        let invariant = |reason: String| HistEqError::launch(stage.label, reason);

        if stage.output == BufferRole::Output {
            let (out, elapsed) = buffers.download_plane(backend, plane.width(), plane.height())?;
            result.output = out;
            return Ok(elapsed);
        }

        let (words, elapsed) = buffers.download_counts(backend, stage.output)?;
        let words: [u32; BIN_COUNT] = words
            .try_into()
            .map_err(|w: Vec<u32>| invariant(format!("read back {} bins, expected {BIN_COUNT}", w.len())))?;

        match stage.output {
            BufferRole::Histogram => {
                let hist = Histogram::from_counts(words);
                hist.verify(pixel_count).map_err(invariant)?;
                result.histogram = Some(hist);
            }
            BufferRole::Cumulative => {
                let cum = CumulativeHistogram::from_values(words);
                cum.verify(pixel_count).map_err(invariant)?;
                result.cumulative = Some(cum);
            }
            BufferRole::Lut => {
                result.lut = Some(Lut::from_words(&words).map_err(invariant)?);
            }
            BufferRole::Input | BufferRole::Output => {}
        }
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::CpuBackend;
    use crate::histeq::equalize_plane;

    fn run_on(plane: &Plane) -> PipelineOutput {
        let backend = CpuBackend::new();
        let buffers = DeviceBufferSet::allocate(&backend, plane.byte_size(), BIN_COUNT).unwrap();
        StagePipeline::standard().run(&backend, &buffers, plane).unwrap()
    }

    #[test]
    fn test_standard_table_validates() {
        assert!(StagePipeline::new(STANDARD_STAGES.to_vec()).is_ok());
    }

    #[test]
    fn test_rejects_stage_reading_unwritten_buffer() {
        // normalize before scan: reads the cumulative buffer too early
        let stages = vec![STANDARD_STAGES[0], STANDARD_STAGES[2], STANDARD_STAGES[1], STANDARD_STAGES[3]];
        let err = StagePipeline::new(stages).unwrap_err();
        assert!(err.to_string().contains("before any stage writes it"), "{err}");
    }

    #[test]
    fn test_rejects_self_read() {
        let mut bad = STANDARD_STAGES[1];
        bad.output = BufferRole::Histogram;
        let err = StagePipeline::new(vec![STANDARD_STAGES[0], bad]).unwrap_err();
        assert!(err.to_string().contains("own output"), "{err}");
    }

    #[test]
    fn test_rejects_table_without_output() {
        let err = StagePipeline::new(STANDARD_STAGES[..3].to_vec()).unwrap_err();
        assert!(matches!(err, HistEqError::Launch { .. }));
    }

    #[test]
    fn test_matches_reference() {
        let data: Vec<u8> = (0..37 * 23).map(|i| ((i * i) % 97 + 40) as u8).collect();
        let plane = Plane::from_vec(37, 23, data);
        let out = run_on(&plane);
        assert_eq!(out.output, equalize_plane(&plane));
        assert_eq!(out.timings.len(), 4);
        assert_eq!(out.timings[3].0, "back-projection");
    }

    #[test]
    fn test_rerun_reuses_buffers() {
        let backend = CpuBackend::new();
        let plane = Plane::from_vec(3, 3, vec![9, 9, 9, 1, 1, 200, 200, 200, 7]);
        let buffers = DeviceBufferSet::allocate(&backend, 9, BIN_COUNT).unwrap();
        let pipeline = StagePipeline::standard();
        let first = pipeline.run(&backend, &buffers, &plane).unwrap();
        let second = pipeline.run(&backend, &buffers, &plane).unwrap();
        assert_eq!(first.output, second.output);
        assert_eq!(second.histogram.unwrap().total(), 9);
    }

    #[test]
    fn test_missing_zero_fill_is_caught() {
        let backend = CpuBackend::new();
        let plane = Plane::filled(4, 4, 3);
        let buffers = DeviceBufferSet::allocate(&backend, 16, BIN_COUNT).unwrap();
        let mut stages = STANDARD_STAGES.to_vec();
        stages[0].zero_output = false;
        let pipeline = StagePipeline::new(stages).unwrap();

        pipeline.run(&backend, &buffers, &plane).unwrap();
        // The histogram buffer still holds the first run's counts.
        let err = pipeline.run(&backend, &buffers, &plane).unwrap_err();
        match err {
            HistEqError::Launch { stage, reason } => {
                assert_eq!(stage, "histogram");
                assert!(reason.contains("sums to 32"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
