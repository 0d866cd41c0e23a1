// tilescan: tiled 2D convolution and recursive block scan on accelerators
//
// Two data-parallel primitives built on scratch-memory staging: a dense
// convolution split into fixed-size tiles, and an inclusive prefix sum
// computed by recursive block-local scans followed by a block-sum
// propagation pass. Both run against the `Device` interface, implemented
// by a simulated accelerator (`device::cpu`) and by wgpu (`gpu`).

pub mod config;
pub mod convolution;
pub mod device;
pub mod error;
pub mod gpu;
pub mod host;
pub mod io;
pub mod job;
pub mod layout;
pub mod matrix;
pub mod reference;
pub mod scan;

pub use config::EngineConfig;
pub use convolution::{ConvolutionEngine, ConvolutionPlan};
pub use device::cpu::CpuDevice;
pub use device::Device;
pub use error::{Error, Result};
pub use host::Host;
pub use matrix::Matrix;
pub use scan::{ScanEngine, ScanOutcome};
