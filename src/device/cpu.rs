// device/cpu.rs — Simulated accelerator.
//
// `CpuDevice` executes the three kernel contracts the way a GPU would:
// one group at a time sees only its own scratch array, staging happens
// before any worker reads scratch, and every step of the group-local scan
// reads the values written by the previous step (a barrier between steps).
// Groups are independent and run in parallel on the rayon pool; nothing is
// shared between groups except the read-only input snapshot.
//
// The launch is validated against the same limits a real device enforces,
// including that the scratch it was given is large enough for what each
// kernel stages. An undersized scratch request is an argument error, not
// silent corruption.
//
// Dispatch runs to completion before returning, so `wait` only reports the
// measured duration.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::trace;

use crate::device::{
    validate_launch, Access, Completed, Device, DeviceError, Extent, Kernel, KernelArgs, Launch,
};
use crate::reference::kernel_center;

/// Bytes of scratch per group, matching the portable wgpu limit.
pub const DEFAULT_SCRATCH_BYTES: usize = 16 * 1024;
/// Workers per group, matching the portable wgpu limit.
pub const DEFAULT_MAX_GROUP_SIZE: usize = 256;
/// Largest single allocation.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1 << 30;

/// A device buffer held in host memory.
pub struct CpuBuffer {
    data: RefCell<Vec<f32>>,
    access: Access,
}

/// A dispatch that has already run.
pub struct CpuEvent {
    kernel: Kernel,
    elapsed: Duration,
}

/// Simulated accelerator with configurable limits.
#[derive(Debug, Clone)]
pub struct CpuDevice {
    name: String,
    scratch_capacity: usize,
    max_group_size: usize,
    max_buffer_bytes: usize,
}

impl Default for CpuDevice {
    fn default() -> Self {
        CpuDevice {
            name: "simulated device".to_string(),
            scratch_capacity: DEFAULT_SCRATCH_BYTES,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the per-group scratch capacity in bytes.
    pub fn with_scratch_capacity(mut self, bytes: usize) -> Self {
        self.scratch_capacity = bytes;
        self
    }

    pub fn with_max_group_size(mut self, workers: usize) -> Self {
        self.max_group_size = workers;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }
}

impl Device for CpuDevice {
    type Buffer = CpuBuffer;
    type Pending = CpuEvent;

    fn name(&self) -> &str {
        &self.name
    }

    fn scratch_capacity(&self) -> usize {
        self.scratch_capacity
    }

    fn max_group_size(&self) -> usize {
        self.max_group_size
    }

    fn allocate(&self, len: usize, access: Access) -> Result<CpuBuffer, DeviceError> {
        let bytes = len.saturating_mul(std::mem::size_of::<f32>());
        if bytes > self.max_buffer_bytes {
            return Err(DeviceError::Allocation {
                device: self.name.clone(),
                len,
                reason: format!("{bytes} bytes exceeds the {} byte limit", self.max_buffer_bytes),
            });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| DeviceError::Allocation {
            device: self.name.clone(),
            len,
            reason: e.to_string(),
        })?;
        data.resize(len, 0.0);
        Ok(CpuBuffer { data: RefCell::new(data), access })
    }

    fn buffer_len(&self, buffer: &CpuBuffer) -> usize {
        buffer.data.borrow().len()
    }

    fn access(&self, buffer: &CpuBuffer) -> Access {
        buffer.access
    }

    fn write(&self, buffer: &CpuBuffer, data: &[f32]) -> Result<(), DeviceError> {
        let mut dst = buffer.data.borrow_mut();
        if data.len() > dst.len() {
            return Err(DeviceError::Transfer(format!(
                "write of {} elements into a buffer of {}",
                data.len(),
                dst.len()
            )));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, buffer: &CpuBuffer) -> Result<Vec<f32>, DeviceError> {
        Ok(buffer.data.borrow().clone())
    }

    fn dispatch(&self, launch: Launch<'_, CpuBuffer>) -> Result<CpuEvent, DeviceError> {
        validate_launch(self, &launch)?;
        let kernel = launch.kernel();
        let start = Instant::now();

        match launch.args {
            KernelArgs::Convolve { input, kernel: weights, output, n, m } => {
                let tile = TileGeometry::new(launch.group, m as usize);
                let a = input.data.borrow().clone();
                let b = weights.data.borrow().clone();
                let mut out = output.data.borrow_mut();
                convolve_tiles(&a, &b, &mut out, n as usize, launch.global, &tile);
            }
            KernelArgs::BlockScan { input, output, aux } => {
                let block = launch.group.x;
                let src = input.data.borrow().clone();
                let mut out = output.data.borrow_mut();
                let mut sums = aux.data.borrow_mut();
                scan_groups(&src, &mut out, &mut sums, launch.global.x, block);
            }
            KernelArgs::BlockScanInPlace { data, aux } => {
                let block = launch.group.x;
                let src = data.data.borrow().clone();
                let mut out = data.data.borrow_mut();
                let mut sums = aux.data.borrow_mut();
                scan_groups(&src, &mut out, &mut sums, launch.global.x, block);
            }
            KernelArgs::AddBlockSums { aux, output } => {
                let block = launch.group.x;
                let sums = aux.data.borrow().clone();
                let mut out = output.data.borrow_mut();
                add_block_sums(&sums, &mut out, launch.global.x, block);
            }
        }

        let elapsed = start.elapsed();
        trace!(%kernel, global = %launch.global, group = %launch.group, ?elapsed, "simulated dispatch");
        Ok(CpuEvent { kernel, elapsed })
    }

    fn wait(&self, pending: CpuEvent) -> Result<Completed, DeviceError> {
        Ok(Completed {
            kernel: pending.kernel,
            elapsed: pending.elapsed,
        })
    }
}

// ============================================================
// Tiled convolution
// ============================================================

/// Scratch footprint of one convolution tile.
struct TileGeometry {
    /// Workers per tile along each axis.
    group: Extent,
    /// Staged input region: tile plus halo, `group + m - 1` per axis.
    halo: Extent,
    m: usize,
    center: usize,
}

impl TileGeometry {
    fn new(group: Extent, m: usize) -> Self {
        TileGeometry {
            group,
            halo: Extent::planar(group.x + m - 1, group.y + m - 1),
            m,
            center: kernel_center(m),
        }
    }
}

/// Run every tile. `out` is the aligned grid, `global.x` elements per row.
fn convolve_tiles(a: &[f32], b: &[f32], out: &mut [f32], n: usize, global: Extent, tile: &TileGeometry) {
    let stride = global.x;
    let band = stride * tile.group.y;
    let tiles_x = global.x / tile.group.x;

    out[..global.total()]
        .par_chunks_mut(band)
        .enumerate()
        .for_each(|(tile_row, band_out)| {
            // Per-group scratch, reused across the tiles of this band.
            let mut a_local = vec![0.0f32; tile.halo.total()];
            let mut b_local = vec![0.0f32; tile.m * tile.m];
            for tile_col in 0..tiles_x {
                let origin_row = tile_row * tile.group.y;
                let origin_col = tile_col * tile.group.x;

                // Phase 1: stage halo region and kernel.
                for r in 0..tile.halo.y {
                    let src_row = (origin_row + r) as isize - tile.center as isize;
                    for c in 0..tile.halo.x {
                        let src_col = (origin_col + c) as isize - tile.center as isize;
                        a_local[r * tile.halo.x + c] = load_or_zero(a, n, src_row, src_col);
                    }
                }
                b_local.copy_from_slice(&b[..tile.m * tile.m]);

                // Barrier. Phase 2: every worker reads scratch only.
                for ly in 0..tile.group.y {
                    let row = origin_row + ly;
                    for lx in 0..tile.group.x {
                        let col = origin_col + lx;
                        if row >= n || col >= n {
                            continue;
                        }
                        let mut acc = 0.0f32;
                        for u in 0..tile.m {
                            let base = (ly + u) * tile.halo.x + lx;
                            for v in 0..tile.m {
                                acc += a_local[base + v] * b_local[u * tile.m + v];
                            }
                        }
                        band_out[ly * stride + col] = acc;
                    }
                }
            }
        });
}

#[inline]
fn load_or_zero(a: &[f32], n: usize, row: isize, col: isize) -> f32 {
    if row < 0 || col < 0 || row as usize >= n || col as usize >= n {
        0.0
    } else {
        a[row as usize * n + col as usize]
    }
}

// ============================================================
// Block scan and add-back
// ============================================================

/// Group-local inclusive scan over the first `len` elements.
fn scan_groups(src: &[f32], out: &mut [f32], aux: &mut [f32], len: usize, block: usize) {
    let groups = len / block;
    out[..len]
        .par_chunks_mut(block)
        .zip(aux[..groups].par_iter_mut())
        .enumerate()
        .for_each(|(g, (chunk, total))| {
            let mut local = src[g * block..(g + 1) * block].to_vec();
            let mut next = vec![0.0f32; block];
            let mut offset = 1;
            while offset < block {
                for t in 0..block {
                    next[t] = if t >= offset { local[t] + local[t - offset] } else { local[t] };
                }
                std::mem::swap(&mut local, &mut next);
                offset *= 2;
            }
            chunk.copy_from_slice(&local);
            *total = local[block - 1];
        });
}

/// Add `aux[g - 1]` to every element of group `g > 0`.
fn add_block_sums(aux: &[f32], out: &mut [f32], len: usize, block: usize) {
    out[..len]
        .par_chunks_mut(block)
        .enumerate()
        .skip(1)
        .for_each(|(g, chunk)| {
            let carry = aux[g - 1];
            for v in chunk {
                *v += carry;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(dev: &CpuDevice, data: &[f32], access: Access) -> CpuBuffer {
        let buf = dev.allocate(data.len(), access).unwrap();
        dev.write(&buf, data).unwrap();
        buf
    }

    #[test]
    fn test_block_scan_per_group() {
        let dev = CpuDevice::new();
        let input = upload(&dev, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], Access::ReadOnly);
        let output = dev.allocate(8, Access::ReadWrite).unwrap();
        let aux = dev.allocate(4, Access::ReadWrite).unwrap();
        let ev = dev
            .dispatch(Launch {
                args: KernelArgs::BlockScan { input: &input, output: &output, aux: &aux },
                global: Extent::linear(8),
                group: Extent::linear(4),
                scratch: vec![4],
            })
            .unwrap();
        let done = dev.wait(ev).unwrap();
        assert_eq!(done.kernel, Kernel::BlockScan);
        assert_eq!(dev.read(&output).unwrap(), vec![1.0, 3.0, 6.0, 10.0, 5.0, 11.0, 18.0, 26.0]);
        assert_eq!(&dev.read(&aux).unwrap()[..2], &[10.0, 26.0]);
    }

    #[test]
    fn test_block_scan_in_place() {
        let dev = CpuDevice::new();
        let data = upload(&dev, &[1.0; 8], Access::ReadWrite);
        let aux = dev.allocate(2, Access::ReadWrite).unwrap();
        dev.dispatch(Launch {
            args: KernelArgs::BlockScanInPlace { data: &data, aux: &aux },
            global: Extent::linear(8),
            group: Extent::linear(4),
            scratch: vec![4],
        })
        .unwrap();
        assert_eq!(dev.read(&data).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dev.read(&aux).unwrap(), vec![4.0, 4.0]);
    }

    #[test]
    fn test_add_block_sums_skips_first_group() {
        let dev = CpuDevice::new();
        let out = upload(&dev, &[1.0; 6], Access::ReadWrite);
        let aux = upload(&dev, &[10.0, 20.0, 30.0], Access::ReadWrite);
        dev.dispatch(Launch {
            args: KernelArgs::AddBlockSums { aux: &aux, output: &out },
            global: Extent::linear(6),
            group: Extent::linear(2),
            scratch: vec![],
        })
        .unwrap();
        assert_eq!(dev.read(&out).unwrap(), vec![1.0, 1.0, 11.0, 11.0, 21.0, 21.0]);
    }

    #[test]
    fn test_convolve_single_tile_matches_reference() {
        use crate::matrix::Matrix;
        use crate::reference::convolve_direct;

        let n = 5;
        let a = Matrix::from_fn(n, |r, c| (r * n + c) as f32 * 0.5);
        let b = Matrix::from_fn(3, |r, c| (r + 2 * c) as f32 - 1.0);
        let dev = CpuDevice::new();
        let da = upload(&dev, a.as_slice(), Access::ReadOnly);
        let db = upload(&dev, b.as_slice(), Access::ReadOnly);
        let dc = dev.allocate(8 * 8, Access::WriteOnly).unwrap();
        dev.dispatch(Launch {
            args: KernelArgs::Convolve { input: &da, kernel: &db, output: &dc, n: 5, m: 3 },
            global: Extent::planar(8, 8),
            group: Extent::planar(4, 4),
            scratch: vec![6 * 6, 9],
        })
        .unwrap();
        let got = Matrix::from_vec_with_stride(n, 8, dev.read(&dc).unwrap()).compact();
        assert!(got.max_abs_diff(&convolve_direct(&a, &b)) < 1e-4);
    }

    #[test]
    fn test_scratch_capacity_enforced() {
        let dev = CpuDevice::new().with_scratch_capacity(64);
        let input = dev.allocate(32, Access::ReadOnly).unwrap();
        let output = dev.allocate(32, Access::ReadWrite).unwrap();
        let aux = dev.allocate(1, Access::ReadWrite).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::BlockScan { input: &input, output: &output, aux: &aux },
                global: Extent::linear(32),
                group: Extent::linear(32),
                scratch: vec![32],
            })
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::ScratchExhausted { requested: 128, capacity: 64, .. }));
    }

    #[test]
    fn test_undersized_tile_scratch_rejected() {
        let dev = CpuDevice::new();
        let da = dev.allocate(16, Access::ReadOnly).unwrap();
        let db = dev.allocate(9, Access::ReadOnly).unwrap();
        let dc = dev.allocate(16, Access::WriteOnly).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::Convolve { input: &da, kernel: &db, output: &dc, n: 4, m: 3 },
                global: Extent::planar(4, 4),
                group: Extent::planar(4, 4),
                // Halo needs 6×6 = 36.
                scratch: vec![30, 9],
            })
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::InvalidArgs { kernel: Kernel::Convolve, .. }));
    }

    #[test]
    fn test_write_to_read_only_rejected() {
        let dev = CpuDevice::new();
        let data = dev.allocate(4, Access::ReadOnly).unwrap();
        let aux = dev.allocate(1, Access::ReadWrite).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::BlockScanInPlace { data: &data, aux: &aux },
                global: Extent::linear(4),
                group: Extent::linear(4),
                scratch: vec![4],
            })
            .err()
            .unwrap();
        assert_eq!(err.code(), -52);
    }

    #[test]
    fn test_aliased_output_and_aux_rejected() {
        let dev = CpuDevice::new();
        let input = upload(&dev, &[1.0; 8], Access::ReadOnly);
        let shared = dev.allocate(8, Access::ReadWrite).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::BlockScan { input: &input, output: &shared, aux: &shared },
                global: Extent::linear(8),
                group: Extent::linear(4),
                scratch: vec![4],
            })
            .err()
            .unwrap();
        assert_eq!(err.code(), -52);
        assert!(err.to_string().contains("same buffer"), "{err}");
        // Rejected before running, so the buffer is untouched.
        assert_eq!(dev.read(&shared).unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_input_bound_as_output_rejected() {
        let dev = CpuDevice::new();
        let data = upload(&dev, &[1.0; 4], Access::ReadWrite);
        let aux = dev.allocate(1, Access::ReadWrite).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::BlockScan { input: &data, output: &data, aux: &aux },
                global: Extent::linear(4),
                group: Extent::linear(4),
                scratch: vec![4],
            })
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::InvalidArgs { kernel: Kernel::BlockScan, .. }));
    }

    #[test]
    fn test_ragged_global_rejected() {
        let dev = CpuDevice::new();
        let out = dev.allocate(6, Access::ReadWrite).unwrap();
        let aux = dev.allocate(2, Access::ReadWrite).unwrap();
        let err = dev
            .dispatch(Launch {
                args: KernelArgs::AddBlockSums { aux: &aux, output: &out },
                global: Extent::linear(6),
                group: Extent::linear(4),
                scratch: vec![],
            })
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::InvalidWorkGroup { .. }));
    }

    #[test]
    fn test_allocation_limit() {
        let dev = CpuDevice::new().with_max_buffer_bytes(1024);
        let err = dev.allocate(257, Access::ReadWrite).err().unwrap();
        assert_eq!(err.code(), -4);
    }

    #[test]
    fn test_write_overflow_rejected() {
        let dev = CpuDevice::new();
        let buf = dev.allocate(2, Access::ReadWrite).unwrap();
        assert!(matches!(dev.write(&buf, &[1.0, 2.0, 3.0]), Err(DeviceError::Transfer(_))));
    }
}
