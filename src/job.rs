// job.rs — End-to-end jobs: file in, device run, file out.
//
// Each job is one pass of the pipeline the binary exposes:
//
//   1. Parse the input file (nothing touches the device on a parse error)
//   2. Validate dimensions against the engine configuration
//   3. Run the engine through a fresh `Host` on the given device
//   4. Optionally recompute on the host with `reference` and compare
//   5. Write the output file
//
// The output file is written last, so any failure, including a failed
// verification, leaves no output behind.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::convolution::ConvolutionEngine;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::io;
use crate::matrix::Matrix;
use crate::reference;
use crate::scan::ScanEngine;

/// What a finished job reports back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    /// Sum of device-reported dispatch durations.
    pub elapsed: Duration,
    pub dispatches: usize,
    /// Scan recursion depth; `None` for convolution.
    pub levels: Option<usize>,
    /// Largest deviation from the host reference, when verified.
    pub deviation: Option<f32>,
}

/// Convolve the matrices in `input` and write the result to `output`.
pub fn run_convolution<D: Device>(
    device: &D,
    config: &EngineConfig,
    input: &Path,
    output: &Path,
) -> Result<JobReport> {
    config.validate()?;
    let (a, b) = io::read_convolution_file(input)?;
    info!(n = a.side(), m = b.side(), device = device.name(), "convolution job");

    let mut host = Host::new(device);
    let c = ConvolutionEngine::from_config(config).run(&mut host, &a, &b)?;
    let deviation = if config.verify {
        Some(verify_convolution(&a, &b, &c)?)
    } else {
        None
    };

    io::write_convolution_file(output, &c)?;
    Ok(JobReport {
        elapsed: host.elapsed(),
        dispatches: host.dispatches(),
        levels: None,
        deviation,
    })
}

/// Prefix-sum the array in `input` and write the result to `output`.
pub fn run_scan<D: Device>(
    device: &D,
    config: &EngineConfig,
    input: &Path,
    output: &Path,
) -> Result<JobReport> {
    config.validate()?;
    let values = io::read_scan_file(input)?;
    info!(n = values.len(), device = device.name(), "scan job");

    let mut host = Host::new(device);
    let outcome = ScanEngine::from_config(config)?.run(&mut host, &values)?;
    info!(levels = outcome.levels, aligned_len = outcome.aligned_len, "scan finished");
    let deviation = if config.verify {
        Some(verify_scan(&values, &outcome.values)?)
    } else {
        None
    };

    io::write_scan_file(output, &outcome.values)?;
    Ok(JobReport {
        elapsed: host.elapsed(),
        dispatches: host.dispatches(),
        levels: Some(outcome.levels),
        deviation,
    })
}

fn verify_convolution(a: &Matrix, b: &Matrix, c: &Matrix) -> Result<f32> {
    let expected = reference::convolve_direct(a, b);
    let deviation = c.max_abs_diff(&expected);
    check(deviation, convolution_tolerance(a, b))
}

fn verify_scan(values: &[f32], scanned: &[f32]) -> Result<f32> {
    let expected = reference::inclusive_scan(values);
    let deviation = reference::max_abs_diff(scanned, &expected);
    check(deviation, reference::scan_tolerance(values))
}

/// Bound on the rounding difference of an M²-term dot product evaluated in
/// two different orders.
fn convolution_tolerance(a: &Matrix, b: &Matrix) -> f32 {
    let peak = |m: &Matrix| m.rows().flatten().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let terms = (b.side() * b.side()).max(1) as f32;
    1e-5 * (terms * peak(a) * peak(b)).max(1.0)
}

fn check(deviation: f32, tolerance: f32) -> Result<f32> {
    // NaN never passes.
    if deviation <= tolerance {
        info!(deviation, tolerance, "verification passed");
        Ok(deviation)
    } else {
        warn!(deviation, tolerance, "verification failed");
        Err(Error::Verification { deviation, tolerance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;
    use std::fs;

    #[test]
    fn test_check_rejects_nan() {
        assert!(check(f32::NAN, 1.0).is_err());
        assert_eq!(check(0.5, 1.0).unwrap(), 0.5);
    }

    #[test]
    fn test_scan_job_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        let output = dir.path().join("output.txt");
        fs::write(&input, "5\n1 2 3 4 5\n").unwrap();

        let config = EngineConfig { verify: true, ..Default::default() };
        let report = run_scan(&CpuDevice::new(), &config, &input, &output).unwrap();
        assert_eq!(report.levels, Some(1));
        assert_eq!(report.dispatches, 1);
        assert_eq!(report.deviation, Some(0.0));
        assert_eq!(fs::read_to_string(&output).unwrap(), "1.000 3.000 6.000 10.000 15.000\n");
    }

    #[test]
    fn test_failed_job_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        let output = dir.path().join("output.txt");
        fs::write(&input, "2 3\n1 2\n3 4\n1 1 1\n1 1 1\n1 1 1\n").unwrap();

        let err = run_convolution(&CpuDevice::new(), &EngineConfig::default(), &input, &output)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!output.exists());
    }
}
