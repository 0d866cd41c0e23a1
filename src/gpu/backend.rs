// gpu/backend.rs — `Device` implementation on wgpu.
//
// BUFFERS
// ───────
// Every buffer is a STORAGE buffer that can also be copied to and from, so
// the same handle serves as upload target, kernel argument and readback
// source. wgpu rejects zero-sized bindings, so an empty buffer still
// occupies one element on the device while reporting length 0.
//
// PIPELINES
// ─────────
// Group size and scratch array sizes are compile-time constants in WGSL, so
// each kernel is compiled per (kernel, group, scratch) shape on first use
// and cached on the device. naga does not support `override` expressions
// inside @workgroup_size() or array lengths, so the values are baked into
// the source with string replacement.
//
// BUILD FAILURES
// ──────────────
// Shader and pipeline creation run inside a validation error scope. On
// failure the compiler messages of the module are collected into the
// returned `DeviceError::Build` and logged together with the adapter name,
// since they are the only actionable information for a broken kernel.
//
// TIMING
// ──────
// `wait` reports the wall time from submission to completion of the
// dispatch's submission index. Timestamp queries need an optional feature
// that many adapters lack.

use std::rc::Rc;
use std::time::Instant;

use tracing::{error, trace};
use wgpu::util::DeviceExt;

use crate::device::{
    validate_launch, Access, Completed, Device, DeviceError, Kernel, KernelArgs, Launch,
};
use crate::gpu::device::{GpuDevice, KernelPipeline, PipelineKey};
use crate::reference::kernel_center;

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

// ---------------------------------------------------------------------------
// Uniform params (must match the WGSL structs exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvParams {
    n: u32,
    m: u32,
    stride: u32,
    center: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct LinearParams {
    group_count: u32,
    groups_per_row: u32,
    _pad0: u32,
    _pad1: u32,
}

/// A device-resident f32 storage buffer.
pub struct GpuBuffer {
    raw: wgpu::Buffer,
    len: usize,
    access: Access,
}

/// A submitted dispatch.
pub struct GpuEvent {
    kernel: Kernel,
    index: wgpu::SubmissionIndex,
    submitted: Instant,
}

impl Device for GpuDevice {
    type Buffer = GpuBuffer;
    type Pending = GpuEvent;

    fn name(&self) -> &str {
        &self.adapter_info.name
    }

    fn scratch_capacity(&self) -> usize {
        self.limits.max_compute_workgroup_storage_size as usize
    }

    fn max_group_size(&self) -> usize {
        self.limits.max_compute_invocations_per_workgroup as usize
    }

    fn allocate(&self, len: usize, access: Access) -> Result<GpuBuffer, DeviceError> {
        let size = (len.max(1) as u64).saturating_mul(F32_BYTES);
        let limit = self.limits.max_buffer_size.min(self.limits.max_storage_buffer_binding_size as u64);
        if size > limit {
            return Err(DeviceError::Allocation {
                device: self.adapter_info.name.clone(),
                len,
                reason: format!("{size} bytes exceeds the {limit} byte binding limit"),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tilescan storage"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Allocation {
                device: self.adapter_info.name.clone(),
                len,
                reason: e.to_string(),
            });
        }
        Ok(GpuBuffer { raw, len, access })
    }

    fn buffer_len(&self, buffer: &GpuBuffer) -> usize {
        buffer.len
    }

    fn access(&self, buffer: &GpuBuffer) -> Access {
        buffer.access
    }

    fn write(&self, buffer: &GpuBuffer, data: &[f32]) -> Result<(), DeviceError> {
        if data.len() > buffer.len {
            return Err(DeviceError::Transfer(format!(
                "write of {} elements into a buffer of {}",
                data.len(),
                buffer.len
            )));
        }
        if !data.is_empty() {
            self.queue.write_buffer(&buffer.raw, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn read(&self, buffer: &GpuBuffer) -> Result<Vec<f32>, DeviceError> {
        if buffer.len == 0 {
            return Ok(Vec::new());
        }
        let size = buffer.len as u64 * F32_BYTES;
        let rb = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tilescan readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&buffer.raw, 0, &rb, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = rb.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // Receiver outlives the poll below.
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DeviceError::Transfer(e.to_string()))?
            .map_err(|e| DeviceError::Transfer(e.to_string()))?;

        let values = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        rb.unmap();
        Ok(values)
    }

    fn dispatch(&self, launch: Launch<'_, GpuBuffer>) -> Result<GpuEvent, DeviceError> {
        validate_launch(self, &launch)?;
        let kernel = launch.kernel();
        let pipeline = self.pipeline(&launch)?;
        let groups = launch.global.groups(launch.group);
        let max_dim = self.limits.max_compute_workgroups_per_dimension as usize;

        let (params, grid) = match launch.args {
            KernelArgs::Convolve { n, m, .. } => {
                if groups.x > max_dim || groups.y > max_dim {
                    return Err(DeviceError::InvalidWorkGroup {
                        kernel,
                        reason: format!("{groups} groups exceed {max_dim} per dimension"),
                    });
                }
                let params = ConvParams {
                    n,
                    m,
                    stride: launch.global.x as u32,
                    center: kernel_center(m as usize) as u32,
                };
                (bytemuck::bytes_of(&params).to_vec(), (groups.x as u32, groups.y as u32))
            }
            _ => {
                let (params, grid) = fold_linear(groups.x, max_dim);
                (bytemuck::bytes_of(&params).to_vec(), grid)
            }
        };

        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("tilescan params"),
            contents: &params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = std::iter::once(&params_buf)
            .chain(storage_bindings(&launch.args))
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(kernel.name()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(grid.0, grid.1, 1);
        }
        let submitted = Instant::now();
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Dispatch { kernel, reason: e.to_string() });
        }

        trace!(%kernel, global = %launch.global, group = %launch.group, grid = ?grid, "submitted");
        Ok(GpuEvent { kernel, index, submitted })
    }

    fn wait(&self, pending: GpuEvent) -> Result<Completed, DeviceError> {
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(pending.index));
        Ok(Completed {
            kernel: pending.kernel,
            elapsed: pending.submitted.elapsed(),
        })
    }
}

impl GpuDevice {
    /// Cached pipeline for the launch's shape, compiling it on first use.
    fn pipeline(&self, launch: &Launch<'_, GpuBuffer>) -> Result<Rc<KernelPipeline>, DeviceError> {
        let key = PipelineKey {
            kernel: launch.kernel(),
            group: (launch.group.x, launch.group.y),
            scratch: launch.scratch.clone(),
        };
        if let Some(p) = self.pipelines.borrow().get(&key) {
            return Ok(Rc::clone(p));
        }
        let built = Rc::new(self.build_pipeline(&key)?);
        self.pipelines.borrow_mut().insert(key, Rc::clone(&built));
        Ok(built)
    }

    fn build_pipeline(&self, key: &PipelineKey) -> Result<KernelPipeline, DeviceError> {
        let (program, source) = shader_source(key);
        let kernel = key.kernel;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        // Binding 0 is always the params uniform; the rest mirror the
        // storage bindings of `storage_bindings`, in order.
        let mut entries = vec![uniform_entry(0)];
        entries.extend(
            storage_read_only(kernel)
                .iter()
                .enumerate()
                .map(|(i, &read_only)| storage_entry(i as u32 + 1, read_only)),
        );
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.name()),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.name()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name()),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: kernel.name(),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            let info = pollster::block_on(shader.get_compilation_info());
            let mut log: Vec<String> = info.messages.iter().map(|msg| msg.message.clone()).collect();
            if log.is_empty() {
                log.push(e.to_string());
            }
            let log = log.join("\n");
            error!(device = %self.adapter_info.name, program, "build log:\n{log}");
            return Err(DeviceError::Build {
                program: program.to_string(),
                device: self.adapter_info.name.clone(),
                log,
            });
        }
        trace!(%kernel, group = ?key.group, scratch = ?key.scratch, "pipeline compiled");
        Ok(KernelPipeline { pipeline, layout })
    }
}

/// Split `groups` 1D groups into a grid no wider than `max_dim`.
fn fold_linear(groups: usize, max_dim: usize) -> (LinearParams, (u32, u32)) {
    let per_row = groups.clamp(1, max_dim.max(1));
    let rows = groups.div_ceil(per_row).max(1);
    let params = LinearParams {
        group_count: groups as u32,
        groups_per_row: per_row as u32,
        _pad0: 0,
        _pad1: 0,
    };
    (params, (per_row as u32, rows as u32))
}

/// WGSL source specialised for `key`, with its program name.
fn shader_source(key: &PipelineKey) -> (&'static str, String) {
    let (gx, gy) = key.group;
    let scratch = |i: usize| key.scratch.get(i).copied().unwrap_or(1).max(1).to_string();
    match key.kernel {
        Kernel::Convolve => (
            "convolution.wgsl",
            include_str!("../shaders/convolution.wgsl")
                .replace("{{TILE_X}}", &gx.to_string())
                .replace("{{TILE_Y}}", &gy.to_string())
                .replace("{{A_LOCAL}}", &scratch(0))
                .replace("{{B_LOCAL}}", &scratch(1)),
        ),
        Kernel::BlockScan | Kernel::BlockScanInPlace => {
            let (source, binding) = if key.kernel == Kernel::BlockScan {
                (
                    "values_in",
                    "@group(0) @binding(3) var<storage, read> values_in: array<f32>;",
                )
            } else {
                ("values_out", "")
            };
            (
                "scan.wgsl",
                include_str!("../shaders/scan.wgsl")
                    .replace("{{SOURCE_BINDING}}", binding)
                    .replace("{{SOURCE}}", source)
                    .replace("{{ENTRY}}", key.kernel.name())
                    .replace("{{BLOCK}}", &gx.to_string())
                    .replace("{{SCRATCH}}", &scratch(0)),
            )
        }
        Kernel::AddBlockSums => (
            "block_sums.wgsl",
            include_str!("../shaders/block_sums.wgsl").replace("{{BLOCK}}", &gx.to_string()),
        ),
    }
}

/// Read-only flag of each storage binding, starting at binding 1.
fn storage_read_only(kernel: Kernel) -> &'static [bool] {
    match kernel {
        // mat_a, mat_b, mat_c
        Kernel::Convolve => &[true, true, false],
        // values_out, totals, values_in
        Kernel::BlockScan => &[false, false, true],
        // values_out, totals
        Kernel::BlockScanInPlace => &[false, false],
        // values_out, totals
        Kernel::AddBlockSums => &[false, true],
    }
}

/// Storage buffers of a launch in binding order, starting at binding 1.
fn storage_bindings<'a>(args: &KernelArgs<'a, GpuBuffer>) -> Vec<&'a wgpu::Buffer> {
    match *args {
        KernelArgs::Convolve { input, kernel, output, .. } => vec![&input.raw, &kernel.raw, &output.raw],
        KernelArgs::BlockScan { input, output, aux } => vec![&output.raw, &aux.raw, &input.raw],
        KernelArgs::BlockScanInPlace { data, aux } => vec![&data.raw, &aux.raw],
        KernelArgs::AddBlockSums { aux, output } => vec![&output.raw, &aux.raw],
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::ConvolutionEngine;
    use crate::gpu::device::DeviceProfile;
    use crate::host::Host;
    use crate::matrix::Matrix;
    use crate::reference::{convolve_direct, inclusive_scan, max_abs_diff, scan_tolerance};
    use crate::scan::ScanEngine;

    fn key(kernel: Kernel, group: (usize, usize), scratch: Vec<usize>) -> PipelineKey {
        PipelineKey { kernel, group, scratch }
    }

    #[test]
    fn test_fold_linear_small() {
        let (params, grid) = fold_linear(10, 65_535);
        assert_eq!(grid, (10, 1));
        assert_eq!(params.groups_per_row, 10);
        assert_eq!(params.group_count, 10);
    }

    #[test]
    fn test_fold_linear_wraps_rows() {
        // 1e8 elements / 256 = 390625 groups → 6 rows of 65535.
        let (params, grid) = fold_linear(390_625, 65_535);
        assert_eq!(grid, (65_535, 6));
        assert!(grid.0 as usize * grid.1 as usize >= 390_625);
        assert_eq!(params.group_count, 390_625);
    }

    #[test]
    fn test_shader_placeholders_all_replaced() {
        let keys = [
            key(Kernel::Convolve, (16, 16), vec![324, 9]),
            key(Kernel::BlockScan, (256, 1), vec![256]),
            key(Kernel::BlockScanInPlace, (256, 1), vec![256]),
            key(Kernel::AddBlockSums, (256, 1), vec![]),
        ];
        for k in &keys {
            let (_, src) = shader_source(k);
            assert!(!src.contains("{{"), "{:?} left a placeholder", k.kernel);
            assert!(src.contains(&format!("fn {}(", k.kernel.name())));
        }
    }

    #[test]
    fn test_in_place_scan_has_no_input_binding() {
        let (_, src) = shader_source(&key(Kernel::BlockScanInPlace, (64, 1), vec![64]));
        assert!(!src.contains("var<storage, read> values_in"));
        assert!(!src.contains("values_in["));
        assert!(src.contains("fn block_scan_in_place("));
        let (_, src) = shader_source(&key(Kernel::BlockScan, (64, 1), vec![64]));
        assert!(src.contains("@binding(3) var<storage, read> values_in"));
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<ConvParams>(), 16);
        assert_eq!(std::mem::size_of::<LinearParams>(), 16);
    }

    // ---- GPU integration tests (subprocess isolation, see gpu::device) ----

    use crate::gpu::device::tests::run_gpu_test_in_subprocess;

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_scan_matches_reference() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::Portable).unwrap();
        let values: Vec<f32> = (0..100_003).map(|i| ((i * 7919) % 101) as f32 * 0.01).collect();
        let mut host = Host::new(&gpu);
        let out = ScanEngine::new(256).unwrap().run(&mut host, &values).unwrap();
        assert_eq!(out.levels, 3);
        let want = inclusive_scan(&values);
        assert!(max_abs_diff(&out.values, &want) <= scan_tolerance(&values));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_convolution_matches_reference() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::Portable).unwrap();
        let a = Matrix::from_fn(100, |r, c| ((r * 13 + c * 5) % 17) as f32 - 8.0);
        let b = Matrix::from_fn(5, |r, c| (r as f32 - c as f32) * 0.25);
        let mut host = Host::new(&gpu);
        let got = ConvolutionEngine::default().run(&mut host, &a, &b).unwrap();
        assert!(got.max_abs_diff(&convolve_direct(&a, &b)) < 1e-3);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_scratch_exhausted() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::Portable).unwrap();
        let mut host = Host::new(&gpu);
        let err = ConvolutionEngine::default()
            .run(&mut host, &Matrix::new(64), &Matrix::new(48))
            .unwrap_err();
        assert_eq!(err.code(), Some(-5));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_scan_matches_reference() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_gpu_scan_matches_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_convolution_matches_reference() {
        let out = run_gpu_test_in_subprocess(
            "gpu::backend::tests::inner_gpu_convolution_matches_reference",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_scratch_exhausted() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_gpu_scratch_exhausted");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
