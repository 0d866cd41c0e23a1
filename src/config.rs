// config.rs — Engine configuration.
//
// Block sizes are the only tunables of the core. Hardware bounds (workers
// per group, scratch bytes) are not checked here: they depend on the
// device and are enforced when a launch is validated.

use crate::error::ConfigError;

/// Tile side of the convolution engine.
pub const DEFAULT_TILE_SIZE: usize = 16;
/// Group size of the scan engine.
pub const DEFAULT_SCAN_BLOCK_SIZE: usize = 256;

/// Tunables shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Convolution tile side; each tile is one group of `tile_size²` workers.
    pub tile_size: usize,
    /// Scan group size; also the shrink factor between recursion levels.
    pub scan_block_size: usize,
    /// Recompute every result on the host and fail on disagreement.
    pub verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tile_size: DEFAULT_TILE_SIZE,
            scan_block_size: DEFAULT_SCAN_BLOCK_SIZE,
            verify: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::InvalidTileSize(self.tile_size));
        }
        // A block of 1 would never shrink the next recursion level.
        if self.scan_block_size < 2 {
            return Err(ConfigError::InvalidBlockSize(self.scan_block_size));
        }
        Ok(())
    }
}
