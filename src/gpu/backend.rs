// gpu/backend.rs — `ComputeBackend` on wgpu.
//
// SYNCHRONOUS BY CONSTRUCTION
// ───────────────────────────
// Every operation submits its own command buffer and waits with
// `Maintain::Wait` before returning. There is a single queue, so stage N+1
// can never start before stage N has finished; device buffers are handed
// from stage to stage without touching the host.
//
// ERROR SCOPES
// ────────────
// wgpu reports most failures asynchronously through error scopes rather
// than return values:
//
//   allocate   OutOfMemory + Validation  → Allocation
//   upload     Validation                → Transfer (host→device)
//   zero       Validation                → Transfer (fill)
//   download   Validation, map failure   → Transfer (device→host)
//   launch     Validation                → Launch
//
// TIMESTAMPS
// ──────────
// With TIMESTAMP_QUERY granted, each compute pass writes a begin and end
// timestamp into a two-entry query set. They are resolved and read back
// after the pass; (end - begin) * timestamp_period is the kernel time in
// nanoseconds.

use std::sync::mpsc;
use std::time::Duration;

use log::{debug, warn};
use wgpu::util::DeviceExt;

use crate::backend::{words_for, BufferRole, ComputeBackend, DeviceBuffer, Kernel, KernelLaunch};
use crate::error::{HistEqError, Result, TransferDirection};
use crate::gpu::device::{align_to, GpuDevice, GpuOptions};
use crate::gpu::kernels::{KernelSet, Params};

/// Bytes of one resolved timestamp pair.
const TIMESTAMP_BYTES: u64 = 2 * std::mem::size_of::<u64>() as u64;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// A storage buffer on the GPU.
pub struct GpuBuffer {
    role: BufferRole,
    size: usize,
    buffer: wgpu::Buffer,
}

impl GpuBuffer {
    /// Physical size, whole words.
    fn physical_size(&self) -> u64 {
        self.buffer.size()
    }
}

impl DeviceBuffer for GpuBuffer {
    fn role(&self) -> BufferRole {
        self.role
    }

    fn size(&self) -> usize {
        self.size
    }
}

struct Timestamps {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    period_ns: f32,
}

// ---------------------------------------------------------------------------
// GpuBackend
// ---------------------------------------------------------------------------

/// The device plus its compiled kernels.
///
/// Field order matters for drop order: pipelines and query objects go
/// before the device that created them.
pub struct GpuBackend {
    kernels: KernelSet,
    timestamps: Option<Timestamps>,
    gpu: GpuDevice,
}

impl GpuBackend {
    /// Open the selected device and compile the kernel set.
    pub fn new(options: &GpuOptions) -> Result<Self> {
        let gpu = GpuDevice::new(options)?;
        Self::from_device(gpu)
    }

    pub fn from_device(gpu: GpuDevice) -> Result<Self> {
        let kernels = KernelSet::compile(&gpu)?;

        let timestamps = gpu.timestamps.then(|| Timestamps {
            query_set: gpu.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("kernel timestamps"),
                ty: wgpu::QueryType::Timestamp,
                count: 2,
            }),
            resolve: gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("timestamp resolve"),
                size: TIMESTAMP_BYTES,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("timestamp readback"),
                size: TIMESTAMP_BYTES,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            period_ns: gpu.timestamp_period(),
        });
        if timestamps.is_none() {
            debug!("gpu: kernel timestamps disabled on {}", gpu.adapter_info);
        }

        Ok(GpuBackend { kernels, timestamps, gpu })
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Submit one encoder and block until the queue is idle.
    fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) {
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.gpu.device.poll(wgpu::Maintain::Wait);
    }

    fn pop_scope(&self) -> Option<wgpu::Error> {
        pollster::block_on(self.gpu.device.pop_error_scope())
    }

    /// Map `buffer` for reading, blocking until the map completes.
    fn map_read(&self, buffer: &wgpu::Buffer) -> std::result::Result<(), String> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // the receiver outlives the poll below
            let _ = tx.send(r);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("map callback never ran".to_string()),
        }
    }

    fn read_timestamps(&self, ts: &Timestamps) -> Option<Duration> {
        if let Err(reason) = self.map_read(&ts.readback) {
            warn!("gpu: timestamp readback failed: {reason}");
            return None;
        }
        let ticks: [u64; 2] = {
            let mapped = ts.readback.slice(..).get_mapped_range();
            bytemuck::pod_read_unaligned(&mapped[..TIMESTAMP_BYTES as usize])
        };
        ts.readback.unmap();
        let ns = ticks[1].saturating_sub(ticks[0]) as f64 * ts.period_ns as f64;
        Some(Duration::from_nanos(ns as u64))
    }

    fn workgroups(&self, launch: &KernelLaunch<'_, GpuBuffer>) -> (u32, u32) {
        match launch.kernel {
            // one invocation per word of 4 pixels
            Kernel::Histogram | Kernel::BackProject => {
                self.gpu.dispatch_size(words_for(launch.domain as usize) as u32)
            }
            // a single workgroup scans all bins
            Kernel::Scan => (1, 1),
            Kernel::Normalize => self.gpu.dispatch_size(launch.domain),
        }
    }
}

impl ComputeBackend for GpuBackend {
    type Buffer = GpuBuffer;

    fn name(&self) -> String {
        self.gpu.adapter_info.to_string()
    }

    fn supports_profiling(&self) -> bool {
        self.timestamps.is_some()
    }

    fn allocate(&self, role: BufferRole, size: usize) -> Result<GpuBuffer> {
        // zero-sized bindings are invalid; keep at least one word
        let physical = align_to(size.max(4) as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let max = self.gpu.limits.max_storage_buffer_binding_size as u64;
        if physical > max {
            return Err(HistEqError::Allocation {
                role,
                bytes: size,
                reason: format!("exceeds the device's {max}-byte storage buffer limit"),
            });
        }

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{role} buffer")),
            size: physical,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let validation = self.pop_scope();
        let oom = self.pop_scope();
        if let Some(err) = oom.or(validation) {
            return Err(HistEqError::Allocation { role, bytes: size, reason: err.to_string() });
        }

        debug!("gpu: allocated {role} buffer, {size} bytes ({physical} physical)");
        Ok(GpuBuffer { role, size, buffer })
    }

    fn upload(&self, buffer: &GpuBuffer, data: &[u8]) -> Result<()> {
        let transfer_err = |reason: String| HistEqError::Transfer {
            role: buffer.role,
            direction: TransferDirection::HostToDevice,
            reason,
        };
        if data.len() != buffer.size {
            return Err(transfer_err(format!(
                "source is {} bytes, buffer is {} bytes",
                data.len(),
                buffer.size
            )));
        }

        // write_buffer needs a multiple of 4 bytes; pad the tail with zeros
        let padded;
        let bytes = if data.len() as u64 == buffer.physical_size() {
            data
        } else {
            let mut p = data.to_vec();
            p.resize(buffer.physical_size() as usize, 0);
            padded = p;
            &padded[..]
        };

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.gpu.queue.write_buffer(&buffer.buffer, 0, bytes);
        let encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("upload"),
        });
        self.submit_and_wait(encoder);
        match self.pop_scope() {
            Some(err) => Err(transfer_err(err.to_string())),
            None => Ok(()),
        }
    }

    fn zero(&self, buffer: &GpuBuffer) -> Result<()> {
        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("zero fill"),
        });
        encoder.clear_buffer(&buffer.buffer, 0, None);
        self.submit_and_wait(encoder);
        match self.pop_scope() {
            Some(err) => Err(HistEqError::Transfer {
                role: buffer.role,
                direction: TransferDirection::Fill,
                reason: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn download(&self, buffer: &GpuBuffer, out: &mut [u8]) -> Result<()> {
        let transfer_err = |reason: String| HistEqError::Transfer {
            role: buffer.role,
            direction: TransferDirection::DeviceToHost,
            reason,
        };
        if out.len() != buffer.size {
            return Err(transfer_err(format!(
                "destination is {} bytes, buffer is {} bytes",
                out.len(),
                buffer.size
            )));
        }

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: buffer.physical_size(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("download"),
        });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, buffer.physical_size());
        self.submit_and_wait(encoder);
        if let Some(err) = self.pop_scope() {
            return Err(transfer_err(err.to_string()));
        }

        self.map_read(&staging).map_err(transfer_err)?;
        {
            let mapped = staging.slice(..).get_mapped_range();
            out.copy_from_slice(&mapped[..buffer.size]);
        }
        staging.unmap();
        Ok(())
    }

    fn launch(&self, launch: &KernelLaunch<'_, GpuBuffer>) -> Result<Option<Duration>> {
        launch.validate()?;
        let stage = launch.kernel.name();
        let compiled = self.kernels.get(launch.kernel);

        let words = match launch.kernel {
            Kernel::Histogram | Kernel::BackProject => words_for(launch.domain as usize) as u32,
            Kernel::Scan | Kernel::Normalize => launch.domain,
        };
        let params = Params {
            pixel_count: launch.params.pixel_count,
            bin_count: launch.params.bin_count,
            word_count: words,
            _pad: 0,
        };
        let (wg_x, wg_y) = self.workgroups(launch);

        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let params_buf = self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("kernel params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries: Vec<wgpu::BindGroupEntry> = launch
            .inputs
            .iter()
            .chain(std::iter::once(&launch.output))
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry { binding: i as u32, resource: b.buffer.as_entire_binding() })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: entries.len() as u32,
            resource: params_buf.as_entire_binding(),
        });
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(stage),
            layout: &compiled.layout,
            entries: &entries,
        });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(stage) });
        {
            let timestamp_writes = self.timestamps.as_ref().map(|ts| wgpu::ComputePassTimestampWrites {
                query_set: &ts.query_set,
                beginning_of_pass_write_index: Some(0),
                end_of_pass_write_index: Some(1),
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(stage),
                timestamp_writes,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }
        if let Some(ts) = &self.timestamps {
            encoder.resolve_query_set(&ts.query_set, 0..2, &ts.resolve, 0);
            encoder.copy_buffer_to_buffer(&ts.resolve, 0, &ts.readback, 0, TIMESTAMP_BYTES);
        }
        self.submit_and_wait(encoder);

        if let Some(err) = self.pop_scope() {
            return Err(HistEqError::launch(stage, err.to_string()));
        }
        debug!("gpu: `{stage}` dispatched {wg_x}x{wg_y} workgroups");

        Ok(self.timestamps.as_ref().and_then(|ts| self.read_timestamps(ts)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::DeviceBufferSet;
    use crate::cpu_backend::CpuBackend;
    use crate::gpu::kernels::compile_kernel;
    use crate::histeq::{equalize_plane, BIN_COUNT};
    use crate::image::Plane;
    use crate::pipeline::StagePipeline;

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("subprocess failed for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    fn gradient_plane(w: usize, h: usize) -> Plane {
        let data = (0..w * h).map(|i| ((i * 31 + i / w * 7) % 180 + 30) as u8).collect();
        Plane::from_vec(w, h, data)
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu_reference() {
        let backend = GpuBackend::new(&GpuOptions::default()).expect("need a GPU");
        // odd size: exercises the partial last word
        let plane = gradient_plane(333, 127);

        let buffers = DeviceBufferSet::allocate(&backend, plane.byte_size(), BIN_COUNT).unwrap();
        let out = StagePipeline::standard().run(&backend, &buffers, &plane).unwrap();
        assert_eq!(out.output, equalize_plane(&plane));

        let cpu = CpuBackend::new();
        let cpu_buffers = DeviceBufferSet::allocate(&cpu, plane.byte_size(), BIN_COUNT).unwrap();
        let expected = StagePipeline::standard().run(&cpu, &cpu_buffers, &plane).unwrap();
        assert_eq!(out.histogram, expected.histogram);
        assert_eq!(out.cumulative, expected.cumulative);
        assert_eq!(out.lut, expected.lut);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_rerun_is_stable() {
        let backend = GpuBackend::new(&GpuOptions::default()).expect("need a GPU");
        let plane = gradient_plane(64, 64);
        let buffers = DeviceBufferSet::allocate(&backend, plane.byte_size(), BIN_COUNT).unwrap();
        let pipeline = StagePipeline::standard();
        let a = pipeline.run(&backend, &buffers, &plane).unwrap();
        let b = pipeline.run(&backend, &buffers, &plane).unwrap();
        assert_eq!(a.output, b.output);
        assert_eq!(a.histogram, b.histogram);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_compile_error_has_log() {
        let gpu = GpuDevice::new(&GpuOptions::default()).expect("need a GPU");
        let broken = "@compute @workgroup_size(1) fn scan() { let x: u32 = undefined_thing; }";
        let err = compile_kernel(&gpu, Kernel::Scan, broken).err().expect("must fail to compile");
        match err {
            HistEqError::Compile { kernel, log } => {
                assert_eq!(kernel, "scan");
                assert!(log.contains("undefined_thing"), "build log: {log}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU adapter"]
    fn test_gpu_matches_cpu_reference() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_gpu_matches_cpu_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU adapter"]
    fn test_gpu_rerun_is_stable() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_gpu_rerun_is_stable");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU adapter"]
    fn test_gpu_compile_error_has_log() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_gpu_compile_error_has_log");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
