// convolution.rs — Tiled dense 2D convolution engine.
//
// The N×N output is cut into square tiles of `tile_size` cells, one group
// per tile and one worker per cell. Each group stages into scratch:
//
//   - the input region its tile reads: the tile plus a halo of M - 1 cells,
//     (tile + M - 1)² floats, zero where it falls outside A;
//   - the whole M×M kernel, M² floats (replicated per tile; M is small
//     relative to N).
//
// After a barrier every worker computes its cell from scratch alone, so
// overlapping windows of neighbouring cells cost one global read each.
//
//   global grid: alignedN × alignedN workers, alignedN = ceil(N / tile) * tile
//   ┌────┬────┬──┐
//   │tile│tile│▒▒│   ▒ = workers past N: they stage (zeros) and sync but
//   ├────┼────┼──┤       write nothing
//   │tile│tile│▒▒│
//   └────┴────┴──┘
//
// The result buffer is over-allocated to the aligned grid and the logical
// N×N region is cut out on the host after readback.
//
// BORDER HANDLING: Zero. See reference::convolve_direct for the formula.

use std::borrow::Cow;

use tracing::debug;

use crate::config::EngineConfig;
use crate::device::{Access, Device, Extent, KernelArgs, Launch};
use crate::error::{ConfigError, Result};
use crate::host::Host;
use crate::layout::align;
use crate::matrix::Matrix;
use crate::reference::kernel_center;

/// Geometry of one convolution: sizes, alignment and scratch footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionPlan {
    /// Input and output side.
    pub n: usize,
    /// Kernel side.
    pub m: usize,
    /// Tile side (workers per group along each axis).
    pub tile: usize,
    /// `n` rounded up to a whole number of tiles.
    pub aligned_n: usize,
}

impl ConvolutionPlan {
    /// Validate the problem dimensions and derive the launch geometry.
    pub fn new(n: usize, m: usize, tile: usize) -> std::result::Result<Self, ConfigError> {
        if tile == 0 {
            return Err(ConfigError::InvalidTileSize(tile));
        }
        if m > n {
            return Err(ConfigError::KernelTooLarge { n, m });
        }
        if m == 0 && n > 0 {
            return Err(ConfigError::EmptyKernel);
        }
        let aligned_n = align(n, tile);
        if aligned_n > u32::MAX as usize || aligned_n.checked_mul(aligned_n).is_none() {
            return Err(ConfigError::DimensionOverflow(n));
        }
        Ok(ConvolutionPlan { n, m, tile, aligned_n })
    }

    /// Side of the staged input region: tile plus halo.
    pub fn halo_side(&self) -> usize {
        self.tile + self.m - 1
    }

    /// Offset between a kernel index and the input index it multiplies.
    pub fn center(&self) -> usize {
        kernel_center(self.m)
    }

    /// Scratch arrays per group in f32 elements: [staged input, kernel].
    pub fn scratch(&self) -> Vec<usize> {
        vec![self.halo_side().pow(2), self.m * self.m]
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch().iter().sum::<usize>() * std::mem::size_of::<f32>()
    }

    pub fn global(&self) -> Extent {
        Extent::planar(self.aligned_n, self.aligned_n)
    }

    pub fn group(&self) -> Extent {
        Extent::planar(self.tile, self.tile)
    }

    /// Number of tiles (groups) in the launch.
    pub fn tiles(&self) -> usize {
        (self.aligned_n / self.tile).pow(2)
    }
}

/// Convolution engine: validates, stages and dispatches one tiled pass.
#[derive(Debug, Clone, Copy)]
pub struct ConvolutionEngine {
    tile_size: usize,
}

impl Default for ConvolutionEngine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ConvolutionEngine {
    pub fn new(tile_size: usize) -> Self {
        ConvolutionEngine { tile_size }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.tile_size)
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn plan(&self, a: &Matrix, b: &Matrix) -> std::result::Result<ConvolutionPlan, ConfigError> {
        ConvolutionPlan::new(a.side(), b.side(), self.tile_size)
    }

    /// Convolve `a` with kernel `b` on the host's device.
    ///
    /// # Errors
    /// `ConfigError` when `b` is larger than `a` or empty. `DeviceError`
    /// when the scratch footprint exceeds the device's group memory, or on
    /// any allocation, transfer or dispatch failure.
    pub fn run<D: Device>(&self, host: &mut Host<'_, D>, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        let plan = self.plan(a, b)?;
        debug!(
            n = plan.n,
            m = plan.m,
            aligned_n = plan.aligned_n,
            tiles = plan.tiles(),
            scratch_bytes = plan.scratch_bytes(),
            "convolution plan"
        );
        if plan.n == 0 {
            return Ok(Matrix::new(0));
        }

        let input = host.upload(&contiguous(a), Access::ReadOnly)?;
        let weights = host.upload(&contiguous(b), Access::ReadOnly)?;
        let output = host.allocate(plan.aligned_n * plan.aligned_n, Access::WriteOnly)?;

        host.run(Launch {
            args: KernelArgs::Convolve {
                input: &input,
                kernel: &weights,
                output: &output,
                n: plan.n as u32,
                m: plan.m as u32,
            },
            global: plan.global(),
            group: plan.group(),
            scratch: plan.scratch(),
        })?;

        let grid = host.download(&output)?;
        Ok(Matrix::from_vec_with_stride(plan.n, plan.aligned_n, grid).compact())
    }
}

/// Row-major elements of `m` without stride padding.
fn contiguous(m: &Matrix) -> Cow<'_, [f32]> {
    if m.stride() == m.side() {
        Cow::Borrowed(&m.as_slice()[..m.side() * m.side()])
    } else {
        Cow::Owned(m.rows().flatten().copied().collect())
    }
}
