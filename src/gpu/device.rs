// gpu/device.rs — wgpu device: adapter selection, limits, pipeline cache.
//
// Responsibilities:
//   - Enumerate adapters on the primary backends (Vulkan, Metal, DX12) and
//     select real hardware over software renderers.
//   - Expose a `DeviceProfile` that decides which limits are requested.
//   - Hold the compiled kernel pipelines, keyed by the launch shape they
//     were specialised for (see gpu/backend.rs).
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe, which is slower than the simulated device.
// We enumerate explicitly and take, in order:
//   1. DiscreteGpu or IntegratedGpu (real hardware)
//   2. VirtualGpu or Other (VM pass-through, translation layers)
//   3. Anything left, software included. The adapter name is logged.
//
// DEVICE LIMITS:
// Under `Portable` we request wgpu's default limits rather than what the
// adapter offers. wgpu validates every dispatch against the *requested*
// limits, so a tile whose scratch footprint only fits a large desktop GPU
// is rejected on the development machine too. The scratch capacity and
// group size the engines see come from the requested limits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info};

use crate::device::{DeviceError, Kernel};

/// Which limits to request from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// The adapter's own limits. Largest scratch and groups available.
    #[default]
    Native,
    /// `wgpu::Limits::default()`: 16 KiB scratch, 256 invocations.
    Portable,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Portable => write!(f, "Portable (wgpu default limits)"),
        }
    }
}

/// Cached adapter information for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Everything a compiled kernel variant is specialised on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    pub kernel: Kernel,
    pub group: (usize, usize),
    pub scratch: Vec<usize>,
}

pub(crate) struct KernelPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// The wgpu context: device, queue, requested limits and compiled kernels.
///
/// Expensive to create (instance + device initialisation); hold one for the
/// lifetime of a job.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. Some Vulkan translation layers crash when the instance is
/// destroyed while device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub(crate) limits: wgpu::Limits,
    pub(crate) pipelines: RefCell<HashMap<PipelineKey, Rc<KernelPipeline>>>,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the best adapter with `DeviceProfile::Native`.
    ///
    /// # Errors
    /// `DeviceError::NoSuitableAdapter` if no adapter is visible,
    /// `DeviceError::DeviceRequest` if the adapter refuses the limits.
    pub fn new() -> Result<Self, DeviceError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, DeviceError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, DeviceError> {
        let flags = if cfg!(debug_assertions) {
            // Validation layer in debug builds for shader error feedback.
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        for a in &adapters {
            let info = a.get_info();
            debug!(name = %info.name, backend = ?info.backend, kind = ?info.device_type, "adapter");
        }
        let adapter = select_adapter(adapters).ok_or(DeviceError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        let limits = limits_for_profile(profile, &adapter.limits());

        // wgpu 22: request_device returns (Device, Queue) directly.
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tilescan"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::DeviceRequest(e.to_string()))?;

        info!(
            adapter = %adapter_info,
            %profile,
            scratch_bytes = limits.max_compute_workgroup_storage_size,
            max_group = limits.max_compute_invocations_per_workgroup,
            "gpu device ready"
        );

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            limits,
            pipelines: RefCell::new(HashMap::new()),
            _instance: instance,
        })
    }

    /// Limits the device was created with.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, scratch: {} B }}",
            self.adapter_info, self.profile, self.limits.max_compute_workgroup_storage_size
        )
    }
}

/// Tiered adapter choice: hardware, then virtual/other, then anything.
fn select_adapter(adapters: Vec<wgpu::Adapter>) -> Option<wgpu::Adapter> {
    let mut ranked: Vec<(u8, wgpu::Adapter)> = adapters
        .into_iter()
        .map(|a| (adapter_rank(a.get_info().device_type), a))
        .collect();
    // Stable: keeps enumeration order within a tier.
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().next().map(|(_, a)| a)
}

fn adapter_rank(kind: wgpu::DeviceType) -> u8 {
    match kind {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu => 0,
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 2,
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Limits to request for `profile` on an adapter offering `adapter`.
fn limits_for_profile(profile: DeviceProfile, adapter: &wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => adapter.clone(),
        DeviceProfile::Portable => wgpu::Limits::default(),
    }
}

// ============================================================
// Tests
// ============================================================
