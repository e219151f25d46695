//! Mapping options
//!
//! [`GpuOptions`] collects every knob of the mapping pipeline. The defaults
//! correspond to a conservative configuration for current GPUs: tiles of 32,
//! up to 256×256 blocks, 32×16×4 threads and a small shared-memory budget.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GpuError, Result};

// ============================================================================
// Mapping Strategies
// ============================================================================

/// How consecutive tiles (or points) are distributed over blocks (or threads)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mapping {
    /// Contiguous chunks: unit `k` handles `[k·chunk, (k+1)·chunk)`
    Tile,
    /// Interleaved: unit `k` handles every index congruent to `k`
    Wrap,
}

// ============================================================================
// Options
// ============================================================================

/// Configuration of the GPU mapping pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuOptions {
    /// Tile size per band member; missing entries use `default_tile_size`
    pub tile_sizes: Vec<i64>,

    /// Tile size of band members without an explicit entry
    pub default_tile_size: i64,

    /// Number of blocks per grid dimension, `x` first
    ///
    /// The innermost grid-mapped band member uses the first entry.
    pub grid_sizes: Vec<i64>,

    /// Number of threads per block dimension, `x` first
    ///
    /// The innermost thread-mapped band member uses the first entry.
    pub block_sizes: Vec<i64>,

    /// Shared-memory budget in bytes per block
    pub max_shared_memory: i64,

    /// Allow shared-memory tiles
    pub use_shared_memory: bool,

    /// Allow private (per-thread) tiles
    pub use_private_memory: bool,

    /// Distribution of tiles over blocks
    pub grid_mapping: Mapping,

    /// Distribution of tile points over threads
    pub thread_mapping: Mapping,

    /// Multiply tile loops by the tile size so that loop counters are
    /// element offsets
    pub scale_tile_loops: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        GpuOptions {
            tile_sizes: Vec::new(),
            default_tile_size: 32,
            grid_sizes: vec![256, 256],
            block_sizes: vec![32, 16, 4],
            max_shared_memory: 8192,
            use_shared_memory: true,
            use_private_memory: true,
            grid_mapping: Mapping::Wrap,
            thread_mapping: Mapping::Wrap,
            scale_tile_loops: true,
        }
    }
}

impl GpuOptions {
    /// Tile size of band member `k`
    pub fn tile_size(&self, k: usize) -> i64 {
        self.tile_sizes
            .get(k)
            .copied()
            .unwrap_or(self.default_tile_size)
    }

    /// Checks that all sizes are positive and at most three grid and
    /// block dimensions are requested
    pub fn validate(&self) -> Result<()> {
        if self.default_tile_size <= 0 || self.tile_sizes.iter().any(|&t| t <= 0) {
            return Err(GpuError::InvalidOptions(
                "tile sizes must be positive".to_string(),
            ));
        }
        if self.grid_sizes.is_empty() || self.grid_sizes.len() > 3 {
            return Err(GpuError::InvalidOptions(format!(
                "expected 1 to 3 grid sizes, got {}",
                self.grid_sizes.len()
            )));
        }
        if self.block_sizes.is_empty() || self.block_sizes.len() > 3 {
            return Err(GpuError::InvalidOptions(format!(
                "expected 1 to 3 block sizes, got {}",
                self.block_sizes.len()
            )));
        }
        if self.grid_sizes.iter().chain(&self.block_sizes).any(|&s| s <= 0) {
            return Err(GpuError::InvalidOptions(
                "grid and block sizes must be positive".to_string(),
            ));
        }
        if self.max_shared_memory < 0 {
            return Err(GpuError::InvalidOptions(
                "shared memory budget cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<GpuOptions> {
        let options: GpuOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> Result<GpuOptions> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let options = GpuOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.tile_size(3), 32);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options =
            GpuOptions::from_json_str(r#"{"tile_sizes": [16, 8], "grid_mapping": "tile"}"#)
                .unwrap();
        assert_eq!(options.tile_size(0), 16);
        assert_eq!(options.tile_size(1), 8);
        assert_eq!(options.tile_size(2), 32);
        assert_eq!(options.grid_mapping, Mapping::Tile);
        assert_eq!(options.block_sizes, vec![32, 16, 4]);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let err = GpuOptions::from_json_str(r#"{"block_sizes": [0]}"#).unwrap_err();
        assert!(matches!(err, GpuError::InvalidOptions(_)));
        let err = GpuOptions::from_json_str(r#"{"grid_sizes": [1, 1, 1, 1]}"#).unwrap_err();
        assert!(matches!(err, GpuError::InvalidOptions(_)));
    }

    #[test]
    fn test_options_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_shared_memory": 0, "use_private_memory": false}}"#).unwrap();
        let options = GpuOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.max_shared_memory, 0);
        assert!(!options.use_private_memory);
        assert!(options.use_shared_memory);
    }
}
