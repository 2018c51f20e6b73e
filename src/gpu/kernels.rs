// gpu/kernels.rs — Compiling the four WGSL kernels.
//
// Each kernel lives in its own shader file with `{{WG_SIZE}}` placeholders
// substituted at load time. Bindings follow one convention so a single
// layout builder covers all of them:
//
//   binding 0 .. n-1   inputs          storage, read-only
//   binding n          output          storage, read-write
//   binding n+1        Params          uniform
//
// where n is `Kernel::arity()`. Compilation runs inside a validation error
// scope; naga's diagnostics become the `Compile` error's build log.

use log::debug;

use crate::backend::Kernel;
use crate::error::{HistEqError, Result};
use crate::gpu::device::{GpuDevice, WORKGROUP_SIZE};

/// Scalar arguments; must match `struct Params` in every shader.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Params {
    pub pixel_count: u32,
    pub bin_count: u32,
    pub word_count: u32,
    pub _pad: u32,
}

/// A compiled kernel and its bind group layout.
pub struct CompiledKernel {
    pub kernel: Kernel,
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// All four kernels, compiled once per device.
pub struct KernelSet {
    kernels: Vec<CompiledKernel>,
}

impl KernelSet {
    pub fn compile(gpu: &GpuDevice) -> Result<Self> {
        let kernels = Kernel::ALL
            .iter()
            .map(|&k| compile_kernel(gpu, k, &shader_source(k)))
            .collect::<Result<Vec<_>>>()?;
        Ok(KernelSet { kernels })
    }

    pub fn get(&self, kernel: Kernel) -> &CompiledKernel {
        // compile() builds one entry per Kernel::ALL, in order
        &self.kernels[kernel as usize]
    }
}

/// Shader template and entry point for a kernel.
fn shader_template(kernel: Kernel) -> (&'static str, &'static str) {
    match kernel {
        Kernel::Histogram => (include_str!("../shaders/histogram.wgsl"), "histogram"),
        Kernel::Scan => (include_str!("../shaders/scan.wgsl"), "scan"),
        Kernel::Normalize => (include_str!("../shaders/normalize.wgsl"), "normalize_lut"),
        Kernel::BackProject => (include_str!("../shaders/back_project.wgsl"), "back_project"),
    }
}

/// WGSL source with placeholders filled in.
pub fn shader_source(kernel: Kernel) -> String {
    shader_template(kernel)
        .0
        .replace("{{DOUBLE_WG_SIZE}}", &(2 * WORKGROUP_SIZE).to_string())
        .replace("{{WG_SIZE}}", &WORKGROUP_SIZE.to_string())
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn layout_entries(inputs: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
    let n = inputs as u32;
    let mut entries: Vec<_> = (0..n).map(|b| storage_entry(b, true)).collect();
    entries.push(storage_entry(n, false));
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: n + 1,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });
    entries
}

/// Compile `source` as `kernel`. Exposed so a broken source can be
/// checked for a readable build log.
pub fn compile_kernel(gpu: &GpuDevice, kernel: Kernel, source: &str) -> Result<CompiledKernel> {
    let (_, entry_point) = shader_template(kernel);
    let device = &gpu.device;

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kernel.name()),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(kernel.name()),
        entries: &layout_entries(kernel.arity()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(kernel.name()),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kernel.name()),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(HistEqError::Compile { kernel: kernel.name().to_string(), log: err.to_string() });
    }
    debug!("gpu: compiled kernel `{kernel}` (entry point {entry_point})");
    Ok(CompiledKernel { kernel, pipeline, layout })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 16);
    }

    #[test]
    fn test_placeholders_substituted() {
        for k in Kernel::ALL {
            let src = shader_source(k);
            assert!(!src.contains("{{"), "{k}: unsubstituted placeholder");
            assert!(src.contains(shader_template(k).1), "{k}: entry point missing");
        }
        assert!(shader_source(Kernel::Scan).contains("array<u32, 512>"));
    }

    #[test]
    fn test_layout_bindings() {
        let entries = layout_entries(Kernel::BackProject.arity());
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            entries[2].ty,
            wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: false }, .. }
        ));
        assert!(matches!(
            entries[3].ty,
            wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Uniform, .. }
        ));
    }

    #[test]
    fn test_kernel_set_index_order() {
        for (i, k) in Kernel::ALL.iter().enumerate() {
            assert_eq!(*k as usize, i);
        }
    }
}
