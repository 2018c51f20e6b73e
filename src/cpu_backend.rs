// cpu_backend.rs — Data-parallel CPU executor for the kernel set.
//
// `CpuBackend` implements `ComputeBackend` with rayon. It follows the
// device contract closely enough that the pipeline cannot tell it apart
// from a GPU:
//
//   - Buffers are word arrays behind a lock, packed exactly like device
//     storage buffers (4 pixels per little-endian u32).
//   - `histogram` ACCUMULATES into whatever the output buffer holds, like
//     device atomics. Skip the zero-fill and the counts double.
//   - `scan` is the work-efficient Blelloch scan: an up-sweep building
//     partial sums in a balanced tree, then a down-sweep distributing
//     them, each tree level one parallel pass.
//
// Blelloch on 8 bins (exclusive result, then + input = inclusive):
//
//   input      3  1  7  0  4  1  6  3
//   up d=1     3  4  7  7  4  5  6  9
//   up d=2     3  4  7 11  4  5  6 14
//   up d=4     3  4  7 11  4  5  6 25
//   clear      3  4  7 11  4  5  6  0
//   down d=4   3  4  7  0  4  5  6 11
//   down d=2   3  0  7  4  4 11  6 16
//   down d=1   0  3  4 11 11 15 16 22
//
// Two knobs exist for tests: a simulated device memory limit (so the
// allocation failure path is reachable) and disabling profiling (so the
// "no timestamps" path is reachable).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use rayon::prelude::*;

use crate::backend::{words_for, BufferRole, ComputeBackend, DeviceBuffer, Kernel, KernelLaunch};
use crate::error::{HistEqError, Result, TransferDirection};
use crate::histeq::{normalize_entry, BIN_COUNT};

/// Words per rayon task in the histogram kernel (1024 pixels).
const HIST_CHUNK_WORDS: usize = 256;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// A host-memory stand-in for a device storage buffer.
pub struct CpuBuffer {
    role: BufferRole,
    size: usize,
    words: RwLock<Vec<u32>>,
    /// Shared allocation counter of the owning backend.
    accounted: Arc<AtomicUsize>,
}

impl DeviceBuffer for CpuBuffer {
    fn role(&self) -> BufferRole {
        self.role
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        self.accounted.fetch_sub(words_for(self.size) * 4, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// CpuBackend
// ---------------------------------------------------------------------------

/// rayon-backed `ComputeBackend`.
pub struct CpuBackend {
    profiling: bool,
    memory_limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Profiling on, no memory limit.
    pub fn new() -> Self {
        CpuBackend { profiling: true, memory_limit: None, allocated: Arc::new(AtomicUsize::new(0)) }
    }

    /// Enable or disable kernel timing.
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    /// Fail allocations once live buffers would exceed `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Bytes currently held by live buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl ComputeBackend for CpuBackend {
    type Buffer = CpuBuffer;

    fn name(&self) -> String {
        format!("CPU (rayon, {} threads)", rayon::current_num_threads())
    }

    fn supports_profiling(&self) -> bool {
        self.profiling
    }

    fn allocate(&self, role: BufferRole, size: usize) -> Result<CpuBuffer> {
        let physical = words_for(size) * 4;
        let in_use = self.allocated.fetch_add(physical, Ordering::Relaxed);
        if let Some(limit) = self.memory_limit {
            if in_use + physical > limit {
                self.allocated.fetch_sub(physical, Ordering::Relaxed);
                return Err(HistEqError::Allocation {
                    role,
                    bytes: size,
                    reason: format!("device memory exhausted ({in_use} of {limit} bytes in use)"),
                });
            }
        }
        debug!("cpu: allocated {role} buffer, {size} bytes ({physical} physical)");
        Ok(CpuBuffer {
            role,
            size,
            words: RwLock::new(vec![0u32; physical / 4]),
            accounted: Arc::clone(&self.allocated),
        })
    }

    fn upload(&self, buffer: &CpuBuffer, data: &[u8]) -> Result<()> {
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
        let mut words = buffer.words.write().map_err(|_| transfer_err("buffer lock poisoned".into()))?;
        pack_words(data, &mut words);
        Ok(())
    }

    fn zero(&self, buffer: &CpuBuffer) -> Result<()> {
        let mut words = buffer.words.write().map_err(|_| HistEqError::Transfer {
            role: buffer.role,
            direction: TransferDirection::Fill,
            reason: "buffer lock poisoned".into(),
        })?;
        words.par_iter_mut().for_each(|w| *w = 0);
        Ok(())
    }

    fn download(&self, buffer: &CpuBuffer, out: &mut [u8]) -> Result<()> {
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
        let words = buffer.words.read().map_err(|_| transfer_err("buffer lock poisoned".into()))?;
        unpack_words(&words, out);
        Ok(())
    }

    fn launch(&self, launch: &KernelLaunch<'_, CpuBuffer>) -> Result<Option<Duration>> {
        launch.validate()?;
        let stage = launch.kernel.name();
        let poisoned = || HistEqError::launch(stage, "buffer lock poisoned");

        let inputs = launch
            .inputs
            .iter()
            .map(|b| b.words.read().map_err(|_| poisoned()))
            .collect::<Result<Vec<_>>>()?;
        let mut output = launch.output.words.write().map_err(|_| poisoned())?;

        let domain = launch.domain as usize;
        let params = launch.params;
        let start = Instant::now();

        match launch.kernel {
            Kernel::Histogram => {
                require_words(stage, &inputs[0], words_for(domain))?;
                // every byte value indexes a bin
                require_words(stage, &output, BIN_COUNT)?;
                histogram(&inputs[0], domain, &mut output);
            }
            Kernel::Scan => {
                require_words(stage, &inputs[0], domain)?;
                require_words(stage, &output, domain)?;
                let scanned = blelloch_inclusive_scan(&inputs[0][..domain]);
                output[..domain].copy_from_slice(&scanned);
            }
            Kernel::Normalize => {
                require_words(stage, &inputs[0], domain)?;
                require_words(stage, &output, domain)?;
                let total = params.pixel_count;
                output[..domain]
                    .par_iter_mut()
                    .zip(inputs[0][..domain].par_iter())
                    .for_each(|(o, &c)| *o = normalize_entry(c, total));
            }
            Kernel::BackProject => {
                let words = words_for(domain);
                require_words(stage, &inputs[0], words)?;
                require_words(stage, &inputs[1], BIN_COUNT)?;
                require_words(stage, &output, words)?;
                back_project(&inputs[0], &inputs[1], domain, &mut output);
            }
        }

        let elapsed = start.elapsed();
        Ok(self.profiling.then_some(elapsed))
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

fn require_words(stage: &str, words: &[u32], needed: usize) -> Result<()> {
    if words.len() < needed {
        return Err(HistEqError::launch(
            stage,
            format!("buffer holds {} words, launch needs {needed}", words.len()),
        ));
    }
    Ok(())
}

/// Privatized histogram: each task counts its chunk locally, then flushes
/// into the shared bins with atomic adds on top of their current values.
fn histogram(input: &[u32], pixel_count: usize, bins: &mut [u32]) {
    let shared: Vec<AtomicU32> = bins.iter().map(|&b| AtomicU32::new(b)).collect();
    let words = words_for(pixel_count);

    input[..words].par_chunks(HIST_CHUNK_WORDS).enumerate().for_each(|(chunk, ws)| {
        let mut local = [0u32; 256];
        let base = chunk * HIST_CHUNK_WORDS * 4;
        for (i, w) in ws.iter().enumerate() {
            for (k, byte) in w.to_le_bytes().iter().enumerate() {
                if base + i * 4 + k < pixel_count {
                    local[*byte as usize] += 1;
                }
            }
        }
        for (bin, &count) in local.iter().enumerate() {
            if count > 0 {
                shared[bin].fetch_add(count, Ordering::Relaxed);
            }
        }
    });

    for (b, s) in bins.iter_mut().zip(shared) {
        *b = s.into_inner();
    }
}

/// Work-efficient inclusive scan. Pads to a power of two internally.
pub(crate) fn blelloch_inclusive_scan(input: &[u32]) -> Vec<u32> {
    let n = input.len().next_power_of_two();
    let mut tree = vec![0u32; n];
    tree[..input.len()].copy_from_slice(input);

    // Up-sweep: the last element of each 2d-block accumulates the block sum.
    let mut d = 1;
    while d < n {
        tree.par_chunks_mut(2 * d).for_each(|block| {
            block[2 * d - 1] = block[2 * d - 1].wrapping_add(block[d - 1]);
        });
        d *= 2;
    }

    // Down-sweep from a cleared root yields the exclusive scan.
    tree[n - 1] = 0;
    let mut d = n / 2;
    while d >= 1 {
        tree.par_chunks_mut(2 * d).for_each(|block| {
            let left = block[d - 1];
            block[d - 1] = block[2 * d - 1];
            block[2 * d - 1] = block[2 * d - 1].wrapping_add(left);
        });
        d /= 2;
    }

    tree.truncate(input.len());
    tree.par_iter_mut().zip(input.par_iter()).for_each(|(e, &x)| *e = e.wrapping_add(x));
    tree
}

/// One output word (4 pixels) per task; padding bytes stay zero.
fn back_project(input: &[u32], lut: &[u32], pixel_count: usize, output: &mut [u32]) {
    let words = words_for(pixel_count);
    output[..words].par_iter_mut().zip(input[..words].par_iter()).enumerate().for_each(
        |(i, (o, &w))| {
            let mut bytes = w.to_le_bytes();
            for (k, b) in bytes.iter_mut().enumerate() {
                *b = if i * 4 + k < pixel_count { (lut[*b as usize] & 0xFF) as u8 } else { 0 };
            }
            *o = u32::from_le_bytes(bytes);
        },
    );
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

fn pack_words(data: &[u8], words: &mut [u32]) {
    words.iter_mut().for_each(|w| *w = 0);
    for (w, chunk) in words.iter_mut().zip(data.chunks(4)) {
        let mut bytes = [0u8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        *w = u32::from_le_bytes(bytes);
    }
}

fn unpack_words(words: &[u32], out: &mut [u8]) {
    for (chunk, w) in out.chunks_mut(4).zip(words.iter()) {
        let bytes = w.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KernelParams;
    use crate::histeq::{compute_histogram, inclusive_scan, Histogram, BIN_COUNT};
    use crate::image::Plane;

    fn counts_of(backend: &CpuBackend, buf: &CpuBuffer) -> Vec<u32> {
        let mut bytes = vec![0u8; buf.size()];
        backend.download(buf, &mut bytes).unwrap();
        bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn test_blelloch_matches_serial() {
        let input: Vec<u32> = (0..256).map(|i| (i * 7 + 3) % 11).collect();
        let mut counts = [0u32; BIN_COUNT];
        counts.copy_from_slice(&input);
        let expected = inclusive_scan(&Histogram::from_counts(counts));
        assert_eq!(blelloch_inclusive_scan(&input), expected.values().to_vec());
    }

    #[test]
    fn test_blelloch_worked_example() {
        let out = blelloch_inclusive_scan(&[3, 1, 7, 0, 4, 1, 6, 3]);
        assert_eq!(out, vec![3, 4, 11, 11, 15, 16, 22, 25]);
    }

    #[test]
    fn test_blelloch_non_power_of_two() {
        assert_eq!(blelloch_inclusive_scan(&[1, 1, 1, 1, 1]), vec![1, 2, 3, 4, 5]);
        assert!(blelloch_inclusive_scan(&[]).is_empty());
    }

    #[test]
    fn test_pack_unpack_odd_length() {
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        let mut words = [0xFFFF_FFFFu32; 2];
        pack_words(&data, &mut words);
        assert_eq!(words[1] >> 24, 0, "tail padding must be zero");
        let mut back = [0u8; 7];
        unpack_words(&words, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn test_histogram_kernel_accumulates() {
        let backend = CpuBackend::new();
        let data: Vec<u8> = (0..3001).map(|i| (i % 256) as u8).collect();
        let plane = Plane::from_vec(3001, 1, data.clone());

        let input = backend.allocate(BufferRole::Input, data.len()).unwrap();
        let hist = backend.allocate(BufferRole::Histogram, BIN_COUNT * 4).unwrap();
        backend.upload(&input, &data).unwrap();

        let launch = KernelLaunch {
            kernel: Kernel::Histogram,
            inputs: vec![&input],
            output: &hist,
            domain: data.len() as u32,
            params: KernelParams { pixel_count: data.len() as u32, bin_count: BIN_COUNT as u32 },
        };
        backend.launch(&launch).unwrap();
        let expected = compute_histogram(&plane);
        assert_eq!(counts_of(&backend, &hist), expected.counts().to_vec());

        // Without a zero-fill the second launch doubles every bin.
        backend.launch(&launch).unwrap();
        let doubled: Vec<u32> = expected.counts().iter().map(|c| c * 2).collect();
        assert_eq!(counts_of(&backend, &hist), doubled);

        backend.zero(&hist).unwrap();
        backend.launch(&launch).unwrap();
        assert_eq!(counts_of(&backend, &hist), expected.counts().to_vec());
    }

    #[test]
    fn test_memory_limit() {
        let backend = CpuBackend::new().with_memory_limit(1024);
        let a = backend.allocate(BufferRole::Input, 1000).unwrap();
        let err = backend.allocate(BufferRole::Output, 1000).err().unwrap();
        assert!(matches!(err, HistEqError::Allocation { role: BufferRole::Output, .. }));
        drop(a);
        assert_eq!(backend.allocated_bytes(), 0);
        assert!(backend.allocate(BufferRole::Output, 1000).is_ok());
    }

    #[test]
    fn test_upload_size_mismatch() {
        let backend = CpuBackend::new();
        let buf = backend.allocate(BufferRole::Input, 8).unwrap();
        let err = backend.upload(&buf, &[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            HistEqError::Transfer { direction: TransferDirection::HostToDevice, .. }
        ));
    }

    #[test]
    fn test_profiling_disabled_returns_none() {
        let backend = CpuBackend::new().with_profiling(false);
        assert!(!backend.supports_profiling());
        let cum = backend.allocate(BufferRole::Cumulative, BIN_COUNT * 4).unwrap();
        let lut = backend.allocate(BufferRole::Lut, BIN_COUNT * 4).unwrap();
        let t = backend
            .launch(&KernelLaunch {
                kernel: Kernel::Normalize,
                inputs: vec![&cum],
                output: &lut,
                domain: BIN_COUNT as u32,
                params: KernelParams { pixel_count: 1, bin_count: BIN_COUNT as u32 },
            })
            .unwrap();
        assert!(t.is_none());
    }
}
