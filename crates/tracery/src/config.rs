//! Build parameters that are fixed once a [`RenderContext`](crate::RenderContext) is created.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generic::TlasInstanceDesc;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the scratch ring shared by bottom-level builds, in bytes.
    pub blas_scratch_size: usize,

    /// Capacity of the scratch ring used by top-level builds, in bytes.
    pub tlas_scratch_size: usize,

    /// Maximum number of bottom-level structures processed per frame.
    pub blas_builds_per_frame: usize,

    /// Command list holding more than this many commands is submitted automatically.
    pub command_cycle_threshold: usize,

    /// Maximum number of command lists each manager keeps.
    pub max_command_lists: usize,

    /// Upper bound for any host wait on a fence, in milliseconds.
    pub fence_timeout_ms: u64,

    /// Number of frames that can be in flight simultaneously.
    pub frames_in_flight: usize,

    /// Largest instance count of a top-level build.
    /// Instances are indexed with 24 bits, so it can't exceed 2^24.
    pub max_tlas_instances: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            blas_scratch_size: 32 << 20,
            tlas_scratch_size: 8 << 20,
            blas_builds_per_frame: 100,
            command_cycle_threshold: 128,
            max_command_lists: 8,
            fence_timeout_ms: 10_000,
            frames_in_flight: 2,
            max_tlas_instances: TlasInstanceDesc::MAX_INSTANCES,
        }
    }
}

impl Config {
    /// Parses configuration from TOML document.
    /// Missing keys take default values.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames_in_flight must be at least 1"));
        }
        if self.max_command_lists == 0 {
            return Err(ConfigError::Invalid("max_command_lists must be at least 1"));
        }
        if self.blas_scratch_size == 0 || self.tlas_scratch_size == 0 {
            return Err(ConfigError::Invalid("scratch rings cannot be empty"));
        }
        if self.max_tlas_instances == 0 || self.max_tlas_instances > TlasInstanceDesc::MAX_INSTANCES
        {
            return Err(ConfigError::Invalid(
                "max_tlas_instances must be between 1 and 16777216",
            ));
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}
