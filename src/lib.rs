// gpu-histeq: GPU-accelerated histogram equalization
//
// Four dependent data-parallel stages over device-resident buffers:
//
//   input plane → histogram → cumulative histogram → LUT → back-projection
//
// Colour images are equalized on the luma plane of a YCbCr split and
// recombined afterwards. Stages run on any `ComputeBackend`: wgpu compute
// shaders (`gpu`) or the rayon CPU reference (`cpu_backend`).

pub mod error;
pub mod image;
pub mod histeq;
pub mod color;
pub mod backend;
pub mod cpu_backend;
pub mod buffers;
pub mod profiling;
pub mod pipeline;
pub mod assemble;
pub mod equalizer;
pub mod io;
pub mod gpu;

#[cfg(feature = "display")]
pub mod display;

pub use backend::{BufferRole, ComputeBackend, Kernel};
pub use cpu_backend::CpuBackend;
pub use equalizer::{Equalized, Equalizer, EqualizerConfig};
pub use error::{HistEqError, Result};
pub use gpu::backend::GpuBackend;
pub use gpu::device::{DeviceSelection, GpuOptions};
pub use image::{Image, Plane};
