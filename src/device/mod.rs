// device/mod.rs — The accelerator capability interface.
//
// The engines never touch a concrete accelerator. They see a `Device`: an
// opaque allocator of f32 buffers, two transfer directions, and a
// dispatch/wait pair. Kernel bodies live behind the dispatch call and are
// identified by `Kernel`; the engine only promises to hand each kernel the
// arguments, extents and scratch sizes its contract requires.
//
// Two implementations exist:
//
//   cpu::CpuDevice   simulated accelerator, always available, used by
//                    tests. Executes each group against an explicit
//                    scratch array with phase barriers.
//   gpu::GpuDevice   wgpu compute backend (see src/gpu/).
//
// LAUNCH VALIDATION
// ─────────────────
// Both backends run `validate_launch` before doing any work, so a launch
// that would be rejected by real hardware (scratch overrun, a group that
// does not tile the grid, a kernel writing a read-only buffer) fails the
// same way on the simulated device. A buffer bound twice where either
// binding writes it is rejected as well.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub mod cpu;

/// Kernel-side access mode of a buffer, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// A 1D or 2D extent, in workers (global) or workers per group (group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub x: usize,
    pub y: usize,
}

impl Extent {
    pub const fn linear(x: usize) -> Self {
        Extent { x, y: 1 }
    }

    pub const fn planar(x: usize, y: usize) -> Self {
        Extent { x, y }
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.x * self.y
    }

    /// Number of groups of `group` needed to cover this extent, per axis.
    #[inline]
    pub fn groups(&self, group: Extent) -> Extent {
        Extent {
            x: self.x / group.x,
            y: self.y / group.y,
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.y == 1 {
            write!(f, "{}", self.x)
        } else {
            write!(f, "{}×{}", self.x, self.y)
        }
    }
}

/// Identifies a kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Tiled convolution with scratch staging of the halo and the kernel.
    Convolve,
    /// Group-local inclusive scan, separate input and output.
    BlockScan,
    /// Group-local inclusive scan, overwriting its input.
    BlockScanInPlace,
    /// Adds the preceding group's propagated total to every element.
    AddBlockSums,
}

impl Kernel {
    /// Entry-point name, shared by the WGSL sources.
    pub fn name(self) -> &'static str {
        match self {
            Kernel::Convolve => "convolve",
            Kernel::BlockScan => "block_scan",
            Kernel::BlockScanInPlace => "block_scan_in_place",
            Kernel::AddBlockSums => "add_block_sums",
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed argument list of one dispatch. The variant selects the kernel.
pub enum KernelArgs<'a, B> {
    /// `output[i][j] = Σ input[i+u-c][j+v-c] * kernel[u][v]`, written only
    /// where `i, j < n`. `input` is n×n, `kernel` m×m, `output` is the
    /// aligned grid covered by the launch.
    Convolve {
        input: &'a B,
        kernel: &'a B,
        output: &'a B,
        n: u32,
        m: u32,
    },
    /// Per group g: `output[g*bs + t] = Σ_{k<=t} input[g*bs + k]`,
    /// `aux[g] = output[g*bs + bs - 1]`.
    BlockScan {
        input: &'a B,
        output: &'a B,
        aux: &'a B,
    },
    /// As `BlockScan` with `input == output == data`.
    BlockScanInPlace { data: &'a B, aux: &'a B },
    /// Per group g > 0: `output[g*bs + t] += aux[g - 1]`.
    AddBlockSums { aux: &'a B, output: &'a B },
}

impl<B> KernelArgs<'_, B> {
    pub fn kernel(&self) -> Kernel {
        match self {
            KernelArgs::Convolve { .. } => Kernel::Convolve,
            KernelArgs::BlockScan { .. } => Kernel::BlockScan,
            KernelArgs::BlockScanInPlace { .. } => Kernel::BlockScanInPlace,
            KernelArgs::AddBlockSums { .. } => Kernel::AddBlockSums,
        }
    }

    /// Scratch each group must be given, in f32 elements, in the order the
    /// kernel declares its scratch arrays.
    pub fn required_scratch(&self, group: Extent) -> Vec<usize> {
        match *self {
            KernelArgs::Convolve { m, .. } => {
                let m = m as usize;
                let halo = Extent::planar(group.x + m - 1, group.y + m - 1);
                vec![halo.total(), m * m]
            }
            KernelArgs::BlockScan { .. } | KernelArgs::BlockScanInPlace { .. } => vec![group.x],
            KernelArgs::AddBlockSums { .. } => Vec::new(),
        }
    }

    /// Every buffer argument with the minimum length the launch needs and
    /// whether the kernel reads and/or writes it.
    fn bindings(&self, global: Extent, group: Extent) -> Vec<Binding<'_, B>> {
        let groups = global.groups(group).total();
        match *self {
            KernelArgs::Convolve { input, kernel, output, n, m } => vec![
                Binding::read(input, "input", (n as usize).pow(2)),
                Binding::read(kernel, "kernel", (m as usize).pow(2)),
                Binding::write(output, "output", global.total()),
            ],
            KernelArgs::BlockScan { input, output, aux } => vec![
                Binding::read(input, "input", global.total()),
                Binding::write(output, "output", global.total()),
                Binding::write(aux, "aux", groups),
            ],
            KernelArgs::BlockScanInPlace { data, aux } => vec![
                Binding::read_write(data, "data", global.total()),
                Binding::write(aux, "aux", groups),
            ],
            KernelArgs::AddBlockSums { aux, output } => vec![
                Binding::read(aux, "aux", groups.saturating_sub(1)),
                Binding::read_write(output, "output", global.total()),
            ],
        }
    }
}

struct Binding<'b, B> {
    buffer: &'b B,
    name: &'static str,
    min_len: usize,
    reads: bool,
    writes: bool,
}

impl<'b, B> Binding<'b, B> {
    fn read(buffer: &'b B, name: &'static str, min_len: usize) -> Self {
        Binding { buffer, name, min_len, reads: true, writes: false }
    }

    fn write(buffer: &'b B, name: &'static str, min_len: usize) -> Self {
        Binding { buffer, name, min_len, reads: false, writes: true }
    }

    fn read_write(buffer: &'b B, name: &'static str, min_len: usize) -> Self {
        Binding { buffer, name, min_len, reads: true, writes: true }
    }
}

/// One dispatch request.
pub struct Launch<'a, B> {
    pub args: KernelArgs<'a, B>,
    /// Total workers; must be a whole number of groups on each axis.
    pub global: Extent,
    /// Workers per group.
    pub group: Extent,
    /// Group scratch allocations, in f32 elements.
    pub scratch: Vec<usize>,
}

impl<B> Launch<'_, B> {
    pub fn kernel(&self) -> Kernel {
        self.args.kernel()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch.iter().sum::<usize>() * std::mem::size_of::<f32>()
    }
}

/// A finished dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Completed {
    pub kernel: Kernel,
    pub elapsed: Duration,
}

impl Completed {
    /// Execution time as measured by the device.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// An accelerator with a two-level memory hierarchy.
///
/// All methods take `&self`; buffers are plain handles and the device
/// serialises access internally.
pub trait Device {
    /// Handle to a device-resident f32 buffer. Dropping it frees the memory.
    type Buffer;
    /// Handle to an in-flight dispatch.
    type Pending;

    /// Human-readable device name for diagnostics.
    fn name(&self) -> &str;

    /// Bytes of fast scratch memory available to one group.
    fn scratch_capacity(&self) -> usize;

    /// Maximum workers per group.
    fn max_group_size(&self) -> usize;

    /// Allocate a zero-filled buffer of `len` f32 elements.
    fn allocate(&self, len: usize, access: Access) -> Result<Self::Buffer, DeviceError>;

    /// Length in elements of a buffer.
    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// Access mode the buffer was allocated with.
    fn access(&self, buffer: &Self::Buffer) -> Access;

    /// Copy host data into the start of `buffer`.
    fn write(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<(), DeviceError>;

    /// Copy the whole buffer back to the host.
    fn read(&self, buffer: &Self::Buffer) -> Result<Vec<f32>, DeviceError>;

    /// Enqueue a kernel. The result may still be executing.
    fn dispatch(&self, launch: Launch<'_, Self::Buffer>) -> Result<Self::Pending, DeviceError>;

    /// Block until the dispatch has finished and all its writes are visible.
    fn wait(&self, pending: Self::Pending) -> Result<Completed, DeviceError>;
}

/// Checks shared by every backend before a launch is executed.
pub fn validate_launch<D: Device + ?Sized>(
    device: &D,
    launch: &Launch<'_, D::Buffer>,
) -> Result<(), DeviceError> {
    let kernel = launch.kernel();
    let (global, group) = (launch.global, launch.group);

    if group.x == 0 || group.y == 0 || group.total() > device.max_group_size() {
        return Err(DeviceError::InvalidWorkGroup {
            kernel,
            reason: format!(
                "group {group} outside 1..={} workers",
                device.max_group_size()
            ),
        });
    }
    if global.x % group.x != 0 || global.y % group.y != 0 {
        return Err(DeviceError::InvalidWorkGroup {
            kernel,
            reason: format!("global extent {global} is not a multiple of group {group}"),
        });
    }

    if kernel != Kernel::Convolve && (group.y != 1 || global.y != 1) {
        return Err(DeviceError::InvalidWorkGroup {
            kernel,
            reason: format!("{kernel} expects a 1D launch, got {global} in groups of {group}"),
        });
    }

    let required = launch.args.required_scratch(group);
    let undersized = launch.scratch.len() < required.len()
        || launch.scratch.iter().zip(&required).any(|(given, need)| given < need);
    if undersized {
        return Err(DeviceError::InvalidArgs {
            kernel,
            reason: format!(
                "scratch {:?} cannot stage a group needing {required:?}",
                launch.scratch
            ),
        });
    }

    let requested = launch.scratch_bytes();
    let capacity = device.scratch_capacity();
    if requested > capacity {
        return Err(DeviceError::ScratchExhausted {
            kernel,
            device: device.name().to_string(),
            requested,
            capacity,
        });
    }

    let bindings = launch.args.bindings(global, group);
    for (i, binding) in bindings.iter().enumerate() {
        let aliased = bindings[i + 1..].iter().find(|other| {
            (binding.writes || other.writes) && std::ptr::eq(binding.buffer, other.buffer)
        });
        if let Some(other) = aliased {
            return Err(DeviceError::InvalidArgs {
                kernel,
                reason: format!("`{}` and `{}` are the same buffer", binding.name, other.name),
            });
        }
        let access = device.access(binding.buffer);
        if (binding.reads && !access.readable()) || (binding.writes && !access.writable()) {
            return Err(DeviceError::InvalidArgs {
                kernel,
                reason: format!("`{}` allocated {access:?}", binding.name),
            });
        }
        let len = device.buffer_len(binding.buffer);
        if len < binding.min_len {
            return Err(DeviceError::InvalidArgs {
                kernel,
                reason: format!(
                    "`{}` holds {len} elements, launch needs {}",
                    binding.name, binding.min_len
                ),
            });
        }
    }
    Ok(())
}

// ============================================================
// Error type
// ============================================================

/// Failures reported by a device backend. None of them is retried.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No adapter passed selection.
    #[error("no suitable compute adapter found")]
    NoSuitableAdapter,
    /// The adapter refused to create a logical device.
    #[error("device request failed: {0}")]
    DeviceRequest(String),
    /// A kernel program failed to compile. `log` is the build diagnostic.
    #[error("kernel program `{program}` failed to build for {device}:\n{log}")]
    Build {
        program: String,
        device: String,
        log: String,
    },
    #[error("allocation of {len} elements failed on {device}: {reason}")]
    Allocation {
        device: String,
        len: usize,
        reason: String,
    },
    /// A launch asked for more group scratch memory than the device has.
    #[error("{kernel} needs {requested} bytes of scratch memory, {device} provides {capacity}")]
    ScratchExhausted {
        kernel: Kernel,
        device: String,
        requested: usize,
        capacity: usize,
    },
    #[error("invalid work-group configuration for {kernel}: {reason}")]
    InvalidWorkGroup { kernel: Kernel, reason: String },
    #[error("invalid arguments to {kernel}: {reason}")]
    InvalidArgs { kernel: Kernel, reason: String },
    #[error("dispatch of {kernel} failed: {reason}")]
    Dispatch { kernel: Kernel, reason: String },
    #[error("buffer transfer failed: {0}")]
    Transfer(String),
}

impl DeviceError {
    /// Stable numeric code printed next to the message.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NoSuitableAdapter => -1,
            DeviceError::DeviceRequest(_) => -2,
            DeviceError::Allocation { .. } => -4,
            DeviceError::ScratchExhausted { .. } => -5,
            DeviceError::Build { .. } => -11,
            DeviceError::Transfer(_) => -30,
            DeviceError::Dispatch { .. } => -36,
            DeviceError::InvalidArgs { .. } => -52,
            DeviceError::InvalidWorkGroup { .. } => -54,
        }
    }
}
