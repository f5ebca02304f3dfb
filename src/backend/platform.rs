// src/backend/platform.rs
// Opaque description of the compute target: how many cores run tiles and how much local
// scratch memory each of them owns.

use serde::{Deserialize, Serialize};

use crate::error::{PoolGradError, Result};

pub const DEFAULT_SCRATCH_BYTES: usize = 196_608;
pub const DEFAULT_VECTOR_BYTES: usize = 256;
pub const DEFAULT_BLOCK_BYTES: usize = 32;
pub const RESERVED_WORKSPACE_BYTES: usize = 16 * 1024 * 1024;

pub const ENV_CORE_NUM: &str = "POOLGRAD_CORE_NUM";
pub const ENV_SCRATCH_BYTES: &str = "POOLGRAD_SCRATCH_BYTES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub core_num: usize,
    pub scratch_bytes: usize,
    pub vector_bytes: usize,
    pub block_bytes: usize,
    pub reserved_workspace_bytes: usize,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        let core_num = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(core_num, DEFAULT_SCRATCH_BYTES)
    }
}

impl PlatformInfo {
    pub fn new(core_num: usize, scratch_bytes: usize) -> Self {
        Self {
            core_num: core_num.max(1),
            scratch_bytes,
            vector_bytes: DEFAULT_VECTOR_BYTES,
            block_bytes: DEFAULT_BLOCK_BYTES,
            reserved_workspace_bytes: RESERVED_WORKSPACE_BYTES,
        }
    }

    /// Defaults overridden by `POOLGRAD_CORE_NUM` and `POOLGRAD_SCRATCH_BYTES`
    pub fn from_env() -> Result<Self> {
        let mut info = Self::default();
        if let Some(cores) = read_env_usize(ENV_CORE_NUM)? {
            if cores == 0 {
                return Err(PoolGradError::Config {
                    key: ENV_CORE_NUM.to_string(),
                    reason: "core count must be at least 1".to_string(),
                });
            }
            info.core_num = cores;
        }
        if let Some(bytes) = read_env_usize(ENV_SCRATCH_BYTES)? {
            info.scratch_bytes = bytes;
        }
        Ok(info)
    }

    pub fn with_vector_bytes(mut self, vector_bytes: usize) -> Self {
        self.vector_bytes = vector_bytes;
        self
    }

    pub fn with_reserved_workspace(mut self, bytes: usize) -> Self {
        self.reserved_workspace_bytes = bytes;
        self
    }
}

impl std::fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cores, {} B scratch/core, {} B vector",
            self.core_num, self.scratch_bytes, self.vector_bytes
        )
    }
}

fn read_env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| PoolGradError::Config {
                key: key.to_string(),
                reason: format!("'{}' is not a valid size: {}", raw, e),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(PoolGradError::Config {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_defaults() {
        let info = PlatformInfo::new(40, DEFAULT_SCRATCH_BYTES);
        assert_eq!(info.core_num, 40);
        assert_eq!(info.vector_bytes, 256);
        assert_eq!(info.block_bytes, 32);
        assert_eq!(info.reserved_workspace_bytes, 16 * 1024 * 1024);
        assert!(PlatformInfo::default().core_num >= 1);
    }

    #[test]
    fn test_zero_cores_are_clamped() {
        assert_eq!(PlatformInfo::new(0, 1024).core_num, 1);
    }

    #[test]
    fn test_env_value_parsing() {
        // Unset keys fall back to defaults without touching the process environment
        assert_eq!(read_env_usize("POOLGRAD_TEST_SURELY_UNSET_KEY").unwrap(), None);
    }
}
