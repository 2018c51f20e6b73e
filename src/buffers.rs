// buffers.rs — The fixed set of device buffers used by one equalization.
//
//   role         access       size
//   ──────────   ──────────   ─────────────────────
//   input        read-only    plane byte size
//   output       read-write   plane byte size
//   histogram    read-write   bin_count * 4 bytes
//   cumulative   read-write   bin_count * 4 bytes
//   LUT          read-write   bin_count * 4 bytes
//
// The set owns every buffer. Stages borrow them through `buffer(role)` for
// the duration of one launch. All transfers are synchronous and report
// their wall-clock duration so the profiler can attribute them to a stage.

use std::time::{Duration, Instant};

use log::debug;

use crate::backend::{BufferRole, ComputeBackend, DeviceBuffer};
use crate::error::{HistEqError, Result, TransferDirection};
use crate::histeq::BIN_COUNT;
use crate::image::Plane;

/// Size in bytes of one counter entry on the device.
const COUNTER_BYTES: usize = std::mem::size_of::<u32>();

pub struct DeviceBufferSet<B: ComputeBackend> {
    input: B::Buffer,
    output: B::Buffer,
    histogram: B::Buffer,
    cumulative: B::Buffer,
    lut: B::Buffer,
    plane_byte_size: usize,
    bin_count: usize,
}

impl<B: ComputeBackend> DeviceBufferSet<B> {
    /// Allocate all five buffers. The first failure is returned and any
    /// buffers already allocated are released.
    ///
    /// `bin_count` must be `BIN_COUNT`: the kernels index a bin with every
    /// possible 8-bit level.
    pub fn allocate(backend: &B, plane_byte_size: usize, bin_count: usize) -> Result<Self> {
        let counter_size = bin_count * COUNTER_BYTES;
        if bin_count != BIN_COUNT {
            return Err(HistEqError::Allocation {
                role: BufferRole::Histogram,
                bytes: counter_size,
                reason: format!("{bin_count} bins requested, 8-bit planes need exactly {BIN_COUNT}"),
            });
        }
        let set = DeviceBufferSet {
            input: backend.allocate(BufferRole::Input, plane_byte_size)?,
            output: backend.allocate(BufferRole::Output, plane_byte_size)?,
            histogram: backend.allocate(BufferRole::Histogram, counter_size)?,
            cumulative: backend.allocate(BufferRole::Cumulative, counter_size)?,
            lut: backend.allocate(BufferRole::Lut, counter_size)?,
            plane_byte_size,
            bin_count,
        };
        debug!(
            "buffers: {} plane bytes ×2, {} bins ×3 on {}",
            plane_byte_size,
            bin_count,
            backend.name()
        );
        Ok(set)
    }

    pub fn buffer(&self, role: BufferRole) -> &B::Buffer {
        match role {
            BufferRole::Input => &self.input,
            BufferRole::Output => &self.output,
            BufferRole::Histogram => &self.histogram,
            BufferRole::Cumulative => &self.cumulative,
            BufferRole::Lut => &self.lut,
        }
    }

    pub fn plane_byte_size(&self) -> usize {
        self.plane_byte_size
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Copy a plane into the input buffer, stripping any row padding.
    pub fn upload_plane(&self, backend: &B, plane: &Plane) -> Result<Duration> {
        if plane.byte_size() != self.plane_byte_size {
            return Err(HistEqError::Transfer {
                role: BufferRole::Input,
                direction: TransferDirection::HostToDevice,
                reason: format!(
                    "plane is {} bytes, buffer set was sized for {}",
                    plane.byte_size(),
                    self.plane_byte_size
                ),
            });
        }
        let start = Instant::now();
        if plane.stride() == plane.width() {
            backend.upload(&self.input, plane.as_slice())?;
        } else {
            backend.upload(&self.input, &plane.to_contiguous())?;
        }
        Ok(start.elapsed())
    }

    /// Zero-fill one buffer.
    pub fn zero(&self, backend: &B, role: BufferRole) -> Result<Duration> {
        let start = Instant::now();
        backend.zero(self.buffer(role))?;
        Ok(start.elapsed())
    }

    /// Read a counter buffer back as `bin_count` u32 values.
    pub fn download_counts(&self, backend: &B, role: BufferRole) -> Result<(Vec<u32>, Duration)> {
        let buffer = self.buffer(role);
        let start = Instant::now();
        let mut bytes = vec![0u8; buffer.size()];
        backend.download(buffer, &mut bytes)?;
        let counts = bytes
            .chunks_exact(COUNTER_BYTES)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((counts, start.elapsed()))
    }

    /// Read the output buffer back as a `width × height` plane.
    pub fn download_plane(&self, backend: &B, width: usize, height: usize) -> Result<(Plane, Duration)> {
        if width * height != self.plane_byte_size {
            return Err(HistEqError::Transfer {
                role: BufferRole::Output,
                direction: TransferDirection::DeviceToHost,
                reason: format!(
                    "{width}x{height} plane does not match the {}-byte buffer",
                    self.plane_byte_size
                ),
            });
        }
        let start = Instant::now();
        let mut data = vec![0u8; self.plane_byte_size];
        backend.download(&self.output, &mut data)?;
        Ok((Plane::from_vec(width, height, data), start.elapsed()))
    }
}
