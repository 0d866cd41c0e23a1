// host.rs — Host-side orchestration primitives.
//
// `Host` wraps a device for the duration of one job and is the only place
// dispatches are issued from. Its `run` enforces the completion barrier the
// engines rely on: a dispatch is waited for before `run` returns, so the
// next stage always reads fully written buffers. No two dispatches are
// ever in flight at once, which together with one writer per buffer per
// stage rules out races on shared device buffers.
//
// Device-reported durations are accumulated into the job's compute time.

use std::time::Duration;

use tracing::debug;

use crate::device::{Access, Completed, Device, DeviceError, Launch};

/// Dispatch sequencer and transfer helper bound to one device.
pub struct Host<'d, D: Device> {
    device: &'d D,
    elapsed: Duration,
    dispatches: usize,
}

impl<'d, D: Device> Host<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Host {
            device,
            elapsed: Duration::ZERO,
            dispatches: 0,
        }
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    /// Allocate a zero-filled buffer of `len` elements.
    pub fn allocate(&self, len: usize, access: Access) -> Result<D::Buffer, DeviceError> {
        self.device.allocate(len, access)
    }

    /// Allocate a buffer sized exactly for `data` and copy `data` into it.
    ///
    /// Callers pad `data` to a whole number of groups first, so the padding
    /// tail is written explicitly rather than relying on allocation zeroing.
    pub fn upload(&self, data: &[f32], access: Access) -> Result<D::Buffer, DeviceError> {
        let buffer = self.device.allocate(data.len(), access)?;
        self.device.write(&buffer, data)?;
        Ok(buffer)
    }

    pub fn download(&self, buffer: &D::Buffer) -> Result<Vec<f32>, DeviceError> {
        self.device.read(buffer)
    }

    /// Dispatch and wait. Returns once every write of the launch is visible.
    pub fn run(&mut self, launch: Launch<'_, D::Buffer>) -> Result<Completed, DeviceError> {
        let kernel = launch.kernel();
        let (global, group) = (launch.global, launch.group);
        let pending = self.device.dispatch(launch)?;
        let done = self.device.wait(pending)?;
        self.elapsed += done.elapsed();
        self.dispatches += 1;
        debug!(%kernel, %global, %group, elapsed = ?done.elapsed(), "dispatch complete");
        Ok(done)
    }

    /// Sum of device-reported execution times of every dispatch so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn dispatches(&self) -> usize {
        self.dispatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;
    use crate::device::{Extent, Kernel, KernelArgs};

    #[test]
    fn test_upload_download_round_trip() {
        let dev = CpuDevice::new();
        let host = Host::new(&dev);
        let buf = host.upload(&[1.0, 2.0, 0.0, 0.0], Access::ReadOnly).unwrap();
        assert_eq!(host.download(&buf).unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_run_counts_dispatches() {
        let dev = CpuDevice::new();
        let mut host = Host::new(&dev);
        let data = host.upload(&[1.0; 8], Access::ReadWrite).unwrap();
        let aux = host.allocate(4, Access::ReadWrite).unwrap();
        let done = host
            .run(Launch {
                args: KernelArgs::BlockScanInPlace { data: &data, aux: &aux },
                global: Extent::linear(8),
                group: Extent::linear(4),
                scratch: vec![4],
            })
            .unwrap();
        assert_eq!(done.kernel, Kernel::BlockScanInPlace);
        assert_eq!(host.dispatches(), 1);
        assert!(host.elapsed() >= done.elapsed());
    }

    #[test]
    fn test_failed_dispatch_not_counted() {
        let dev = CpuDevice::new().with_scratch_capacity(0);
        let mut host = Host::new(&dev);
        let data = host.upload(&[1.0; 4], Access::ReadWrite).unwrap();
        let aux = host.allocate(1, Access::ReadWrite).unwrap();
        let result = host.run(Launch {
            args: KernelArgs::BlockScanInPlace { data: &data, aux: &aux },
            global: Extent::linear(4),
            group: Extent::linear(4),
            scratch: vec![4],
        });
        assert!(matches!(result, Err(DeviceError::ScratchExhausted { .. })));
        assert_eq!(host.dispatches(), 0);
    }
}
