// error.rs — Crate-level error taxonomy.
//
//   ConfigError   invalid dimensions or block sizes; nothing is dispatched.
//   ParseError    malformed input text.
//   DeviceError   backend build or runtime failure (see device/mod.rs).
//
// Broken internal invariants (misaligned level sizes, a scan recursion
// that fails to shrink) are programmer errors and panic instead.

use std::io;

use thiserror::Error;

use crate::device::DeviceError;

/// Rejected problem or engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("kernel side {m} exceeds input side {n}")]
    KernelTooLarge { n: usize, m: usize },
    #[error("kernel matrix is empty")]
    EmptyKernel,
    #[error("tile size must be at least 1 (got {0})")]
    InvalidTileSize(usize),
    #[error("scan block size must be at least 2 (got {0})")]
    InvalidBlockSize(usize),
    #[error("side {0} does not fit the device index range")]
    DimensionOverflow(usize),
}

/// Malformed input file.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {line}: cannot parse `{token}` as {expected}")]
    Invalid {
        line: usize,
        token: String,
        expected: &'static str,
    },
    #[error("unexpected end of input: expected {expected}")]
    Truncated { expected: String },
}

/// Any failure of a convolution or scan job.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("malformed input: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// `--verify` found the device result too far from the reference.
    #[error("device result deviates from reference by {deviation} (tolerance {tolerance})")]
    Verification { deviation: f32, tolerance: f32 },
}

impl Error {
    /// Backend error code, for failures that carry one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Device(e) => Some(e.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Kernel;

    #[test]
    fn test_device_error_keeps_code() {
        let err: Error = DeviceError::InvalidArgs {
            kernel: Kernel::AddBlockSums,
            reason: "x".into(),
        }
        .into();
        assert_eq!(err.code(), Some(-52));
        assert!(err.to_string().starts_with("invalid arguments to add_block_sums"));
    }

    #[test]
    fn test_config_error_has_no_code() {
        let err: Error = ConfigError::KernelTooLarge { n: 3, m: 5 }.into();
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "configuration error: kernel side 5 exceeds input side 3");
    }
}
