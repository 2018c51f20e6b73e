// gpu/mod.rs — wgpu execution backend.
//
// The four histogram-equalization stages as WGSL compute kernels behind
// the `ComputeBackend` trait. `CpuBackend` in the parent crate stays the
// reference: every GPU stage is checked against it bin for bin and pixel
// for pixel.
//
//   device.rs    platform/device enumeration, device + queue, dispatch sizing
//   kernels.rs   shader loading and compute pipeline creation
//   backend.rs   buffers, transfers, launches, timestamp profiling

pub mod backend;
pub mod device;
pub mod kernels;
