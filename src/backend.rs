// backend.rs — Execution backend abstraction.
//
// The stage pipeline never talks to wgpu (or rayon) directly. It drives a
// `ComputeBackend`: an explicit context object that owns the device, has
// compiled the four kernels once, and can allocate, fill, copy and launch.
// Two implementations live in this crate:
//
//   GpuBackend  (gpu/backend.rs)  wgpu compute pipelines, WGSL kernels.
//   CpuBackend  (cpu_backend.rs)  rayon data-parallel reference executor.
//
// DEVICE DATA LAYOUT
// ──────────────────
// Every buffer is an array of little-endian 32-bit words. Counter buffers
// (histogram, cumulative, LUT) hold one u32 per bin. Plane buffers hold
// four pixels per word:
//
//   bytes:  p0 p1 p2 p3 | p4 p5 p6 p7 | p8 0 0 0
//   word:   ---- w0 ---- | ---- w1 ---- | -- w2 ---
//
// A buffer's `size()` is its logical byte size (the plane byte size or
// bins * 4). The physical allocation is rounded up to whole words; the
// tail bytes of the last word are zero and never read back.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Number of 32-bit words needed to store `bytes` bytes.
#[inline]
pub fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

// ---------------------------------------------------------------------------
// Buffer roles
// ---------------------------------------------------------------------------

/// Semantic role of a device buffer. Each role exists exactly once per
/// `DeviceBufferSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Uploaded source plane. Read-only for every stage.
    Input,
    /// Equalized plane written by back-projection.
    Output,
    /// 256 bin counts.
    Histogram,
    /// Inclusive prefix sum of the histogram.
    Cumulative,
    /// Intensity lookup table.
    Lut,
}

impl BufferRole {
    pub const ALL: [BufferRole; 5] = [
        BufferRole::Input,
        BufferRole::Output,
        BufferRole::Histogram,
        BufferRole::Cumulative,
        BufferRole::Lut,
    ];

    /// True for the per-bin u32 counter buffers.
    pub fn is_counter(self) -> bool {
        matches!(self, BufferRole::Histogram | BufferRole::Cumulative | BufferRole::Lut)
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Input => write!(f, "input"),
            BufferRole::Output => write!(f, "output"),
            BufferRole::Histogram => write!(f, "histogram"),
            BufferRole::Cumulative => write!(f, "cumulative histogram"),
            BufferRole::Lut => write!(f, "LUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// The four data-parallel routines every backend must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// `histogram(inputPlane) -> counts[256]`, atomic accumulation.
    Histogram,
    /// `scan(counts[256]) -> cumulative[256]`, inclusive prefix sum.
    Scan,
    /// `normalize(cumulative[256], totalPixels) -> lut[256]`.
    Normalize,
    /// `backProject(inputPlane, lut[256]) -> outputPlane`.
    BackProject,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [Kernel::Histogram, Kernel::Scan, Kernel::Normalize, Kernel::BackProject];

    /// Capability name, as the kernel is known to the backend.
    pub fn name(self) -> &'static str {
        match self {
            Kernel::Histogram => "histogram",
            Kernel::Scan => "scan",
            Kernel::Normalize => "normalize",
            Kernel::BackProject => "backProject",
        }
    }

    /// Number of input buffers the kernel binds, in binding order.
    pub fn arity(self) -> usize {
        match self {
            Kernel::BackProject => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar arguments shared by all kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParams {
    /// Pixels in the plane being equalized. Never zero.
    pub pixel_count: u32,
    /// Bins in the counter buffers.
    pub bin_count: u32,
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

/// An opaque device-memory region tagged with its role and logical size.
pub trait DeviceBuffer {
    fn role(&self) -> BufferRole;

    /// Logical size in bytes.
    fn size(&self) -> usize;
}

/// One kernel invocation. Buffers are borrowed for the duration of the
/// launch only.
pub struct KernelLaunch<'a, B> {
    pub kernel: Kernel,
    /// Input buffers, in the kernel's binding order.
    pub inputs: Vec<&'a B>,
    pub output: &'a B,
    /// Number of work-items (pixels or bins).
    pub domain: u32,
    pub params: KernelParams,
}

impl<B: DeviceBuffer> KernelLaunch<'_, B> {
    /// Check the launch shape before any device work: arity, a non-empty
    /// domain, and no input aliasing the output.
    pub fn validate(&self) -> Result<()> {
        use crate::error::HistEqError;

        let k = self.kernel.name();
        if self.inputs.len() != self.kernel.arity() {
            return Err(HistEqError::launch(
                k,
                format!("expects {} input buffer(s), got {}", self.kernel.arity(), self.inputs.len()),
            ));
        }
        if self.domain == 0 {
            return Err(HistEqError::launch(k, "empty launch domain"));
        }
        if self.params.pixel_count == 0 {
            return Err(HistEqError::launch(k, "pixel count is zero"));
        }
        if let Some(alias) = self.inputs.iter().find(|b| b.role() == self.output.role()) {
            return Err(HistEqError::launch(
                k,
                format!("input {} buffer aliases the output", alias.role()),
            ));
        }
        Ok(())
    }
}

/// An execution context capable of buffer allocation, transfers and
/// launching the compiled kernel set.
///
/// All operations are synchronous: they return once the device-side work
/// they issued is complete.
pub trait ComputeBackend {
    type Buffer: DeviceBuffer;

    /// Human-readable backend/device name for logs.
    fn name(&self) -> String;

    /// Whether `launch` reports kernel execution time.
    fn supports_profiling(&self) -> bool;

    /// Allocate a zero-initialized buffer of `size` logical bytes.
    fn allocate(&self, role: BufferRole, size: usize) -> Result<Self::Buffer>;

    /// Copy `data` (exactly `buffer.size()` bytes) host→device.
    fn upload(&self, buffer: &Self::Buffer, data: &[u8]) -> Result<()>;

    /// Fill the whole buffer with zero.
    fn zero(&self, buffer: &Self::Buffer) -> Result<()>;

    /// Copy `buffer.size()` bytes device→host into `out`.
    fn download(&self, buffer: &Self::Buffer, out: &mut [u8]) -> Result<()>;

    /// Run one kernel to completion. Returns the device execution time
    /// when profiling is available.
    fn launch(&self, launch: &KernelLaunch<'_, Self::Buffer>) -> Result<Option<Duration>>;
}
