// gpu/device.rs — wgpu device selection and context.
//
// Responsibilities:
//   - Enumerate platforms (wgpu backends that expose adapters) and their
//     devices, for `--list` and for index-based selection.
//   - Create the device/queue pair for the selected adapter, with
//     TIMESTAMP_QUERY enabled when profiling is requested and supported.
//   - Dispatch sizing for 1-D domains, tiled into 2-D when a domain needs
//     more workgroups than one dimension allows.
//
// PLATFORMS AND DEVICES
// ─────────────────────
// A platform is one wgpu backend, numbered in a fixed order (Vulkan,
// Metal, DX12, GL) after dropping those without adapters. A device is an
// adapter index within its platform. Selection is therefore stable on a
// given machine and matches what `list_platforms` prints:
//
//   Platform 0: Vulkan
//     Device 0: NVIDIA GeForce RTX 3060 (DiscreteGpu)
//     Device 1: llvmpipe (LLVM 15.0.7, 256 bits) (Cpu)
//   Platform 1: Gl
//     Device 0: Mesa Intel(R) UHD Graphics 620 (IntegratedGpu)
//
// DEVICE LIMITS
// ─────────────
// We start from `downlevel_defaults` (safe on GL and mobile drivers) and
// raise only what this crate needs from the adapter: storage buffer size
// and workgroups per dispatch dimension, which bound the image size.
//
// UNCAPTURED ERRORS
// ─────────────────
// Everything that can fail runs inside an error scope and is turned into
// a `HistEqError`. Anything that slips through is logged by the uncaptured
// error handler instead of aborting the process.

use std::fmt;

use log::{error, info};

use crate::error::{HistEqError, Result};

/// Work-items per workgroup for every kernel. Also the histogram's bin
/// count: the privatized histogram gives each invocation one bin.
pub const WORKGROUP_SIZE: u32 = 256;

/// Platform numbering order.
const PLATFORM_ORDER: [wgpu::Backend; 4] =
    [wgpu::Backend::Vulkan, wgpu::Backend::Metal, wgpu::Backend::Dx12, wgpu::Backend::Gl];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Platform and device indices, as printed by `list_platforms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSelection {
    pub platform: usize,
    pub device: usize,
}

/// Options for creating a `GpuDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuOptions {
    pub selection: DeviceSelection,
    /// Request kernel timestamps (only honoured if the adapter supports them).
    pub profiling: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        GpuOptions { selection: DeviceSelection::default(), profiling: true }
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Cached adapter information for logging and listing.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(info: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// One platform and the devices it exposes.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub index: usize,
    pub backend: wgpu::Backend,
    pub devices: Vec<AdapterInfo>,
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Platform {}: {:?}", self.index, self.backend)?;
        for (i, d) in self.devices.iter().enumerate() {
            write!(f, "\n  Device {i}: {} ({:?})", d.name, d.device_type)?;
        }
        Ok(())
    }
}

fn backend_flag(backend: wgpu::Backend) -> wgpu::Backends {
    match backend {
        wgpu::Backend::Vulkan => wgpu::Backends::VULKAN,
        wgpu::Backend::Metal => wgpu::Backends::METAL,
        wgpu::Backend::Dx12 => wgpu::Backends::DX12,
        wgpu::Backend::Gl => wgpu::Backends::GL,
        _ => wgpu::Backends::empty(),
    }
}

fn create_instance() -> wgpu::Instance {
    // Validation layer in debug builds for shader error feedback.
    let flags = if cfg!(debug_assertions) {
        wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    } else {
        wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    };
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags,
        ..Default::default()
    })
}

/// Non-empty platforms in numbering order, with their adapters.
fn enumerate(instance: &wgpu::Instance) -> Vec<(wgpu::Backend, Vec<wgpu::Adapter>)> {
    PLATFORM_ORDER
        .iter()
        .map(|&b| (b, instance.enumerate_adapters(backend_flag(b))))
        .filter(|(_, adapters)| !adapters.is_empty())
        .collect()
}

/// Every platform with at least one device.
pub fn list_platforms() -> Vec<PlatformInfo> {
    let instance = create_instance();
    enumerate(&instance)
        .into_iter()
        .enumerate()
        .map(|(index, (backend, adapters))| PlatformInfo {
            index,
            backend,
            devices: adapters.iter().map(|a| AdapterInfo::from(a.get_info())).collect(),
        })
        .collect()
}

/// Pick `selection` out of per-platform device counts.
fn resolve_selection(counts: &[usize], selection: DeviceSelection) -> Result<()> {
    let Some(&devices) = counts.get(selection.platform) else {
        return Err(HistEqError::Device(format!(
            "platform {} does not exist ({} platform(s) available)",
            selection.platform,
            counts.len()
        )));
    };
    if selection.device >= devices {
        return Err(HistEqError::Device(format!(
            "device {} does not exist on platform {} ({devices} device(s) available)",
            selection.device, selection.platform
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GpuDevice
// ---------------------------------------------------------------------------

/// The selected adapter's device and queue.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. Some Vulkan layers crash when the instance is destroyed
/// while device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub limits: wgpu::Limits,
    /// TIMESTAMP_QUERY was requested and granted.
    pub timestamps: bool,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create the device selected by `options`.
    ///
    /// # Errors
    /// `Device` if the platform/device index is out of range or the
    /// device request fails.
    pub fn new(options: &GpuOptions) -> Result<Self> {
        pollster::block_on(Self::init_async(options))
    }

    async fn init_async(options: &GpuOptions) -> Result<Self> {
        let instance = create_instance();
        let mut platforms = enumerate(&instance);
        let counts: Vec<usize> = platforms.iter().map(|(_, a)| a.len()).collect();
        resolve_selection(&counts, options.selection)?;

        let (_, mut adapters) = platforms.swap_remove(options.selection.platform);
        let adapter = adapters.swap_remove(options.selection.device);
        let adapter_info = AdapterInfo::from(adapter.get_info());
        info!("selected device: {adapter_info}");

        let timestamps =
            options.profiling && adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let required_features =
            if timestamps { wgpu::Features::TIMESTAMP_QUERY } else { wgpu::Features::empty() };
        let limits = limits_for_adapter(&adapter.limits());

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpu-histeq"),
                    required_features,
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| HistEqError::Device(format!("device request failed: {e}")))?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| error!("uncaptured wgpu error: {e}")));

        Ok(GpuDevice { device, queue, adapter_info, limits, timestamps, _instance: instance })
    }

    /// Workgroup grid covering `work_items` 1-D items.
    ///
    /// The shader linearizes with
    /// `gid.y * num_workgroups.x * WORKGROUP_SIZE + gid.x` and must guard
    /// against indices past the end of the domain.
    pub fn dispatch_size(&self, work_items: u32) -> (u32, u32) {
        dispatch_grid(work_items.div_ceil(WORKGROUP_SIZE), self.limits.max_compute_workgroups_per_dimension)
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.queue.get_timestamp_period()
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, timestamps: {} }}",
            self.adapter_info,
            if self.timestamps { "on" } else { "off" }
        )
    }
}

// ============================================================
// Sizing helpers
// ============================================================

/// Split `groups` workgroups into an (x, y) grid with x ≤ `max_per_dim`.
///
/// x * y may exceed `groups`; the surplus workgroups fall past the end of
/// the domain and are masked by the shader's bounds check.
pub fn dispatch_grid(groups: u32, max_per_dim: u32) -> (u32, u32) {
    if groups <= max_per_dim {
        return (groups.max(1), 1);
    }
    let y = groups.div_ceil(max_per_dim);
    let x = groups.div_ceil(y);
    (x, y)
}

/// Round `value` up to a multiple of `alignment`.
pub fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Limits requested from the adapter.
fn limits_for_adapter(adapter: &wgpu::Limits) -> wgpu::Limits {
    wgpu::Limits {
        max_storage_buffer_binding_size: adapter.max_storage_buffer_binding_size,
        max_buffer_size: adapter.max_buffer_size,
        max_compute_workgroups_per_dimension: adapter.max_compute_workgroups_per_dimension,
        ..wgpu::Limits::downlevel_defaults()
    }
}

// ============================================================
// Tests
// ============================================================
