// gpu/mod.rs — wgpu compute backend.
//
// `GpuDevice` implements the `Device` trait with WGSL kernels. The engines
// drive it exactly like the simulated `CpuDevice`; the CPU reference
// implementations in `reference` remain the authoritative baseline and
// every GPU kernel is validated against them.
//
//   device.rs   adapter selection, profiles, pipeline cache
//   backend.rs  buffers, kernel compilation, dispatch/wait/readback

pub mod backend;
pub mod device;

pub use backend::GpuBuffer;
pub use device::{DeviceProfile, GpuDevice};
