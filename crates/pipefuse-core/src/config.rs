//! Compiler configuration
//!
//! Groups the knobs of the optimizer, the partitioned backend and the device
//! backend into one serde-friendly struct so that a configuration can be
//! loaded from JSON and validated before any query is compiled.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Full compiler configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Optimizer pass toggles
    pub optimizer: OptimizerConfig,
    /// Partitioned backend settings
    pub partition: PartitionConfig,
    /// Device backend settings
    pub device: DeviceConfig,
}

/// Optimizer pass toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Upper bound on rewrite iterations before giving up on a fixed point
    pub max_passes: usize,
    /// Replace nested pipelines in source position by their sub-tree
    pub flatten: bool,
    /// Fold constants and hoist invariant subexpressions
    pub lift: bool,
    /// Merge consecutive element-wise operators
    pub fuse: bool,
    /// Carry tuple fields as separate locals
    pub detuple: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_passes: 8,
            flatten: true,
            lift: true,
            fuse: true,
            detuple: true,
        }
    }
}

/// Partitioned backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Number of partitions; `None` uses the worker pool width
    pub partitions: Option<usize>,
    /// Concatenate list results in source order; otherwise completion order
    pub preserve_order: bool,
    /// Elements per chunk handed out by the producer of a non-indexable source
    pub chunk_size: usize,
    /// Bounded channel capacity (in chunks) between producer and consumers
    pub channel_capacity: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partitions: None,
            preserve_order: true,
            chunk_size: 1024,
            channel_capacity: 4,
        }
    }
}

impl PartitionConfig {
    /// Resolve the effective partition count
    pub fn effective_partitions(&self) -> usize {
        self.partitions
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }
}

/// Device backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Work-group size used by reduction kernels
    pub work_group_size: usize,
    /// Allow double precision kernels (`cl_khr_fp64`)
    pub enable_fp64: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            work_group_size: 64,
            enable_fp64: true,
        }
    }
}

impl CompilerConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Every optimizer pass disabled; lowering sees the tree as built
    pub fn unoptimized() -> Self {
        Self {
            optimizer: OptimizerConfig {
                max_passes: 0,
                flatten: false,
                lift: false,
                fuse: false,
                detuple: false,
            },
            ..Self::default()
        }
    }

    /// Larger chunks and work groups, unordered list concatenation
    pub fn throughput() -> Self {
        Self {
            partition: PartitionConfig {
                partitions: None,
                preserve_order: false,
                chunk_size: 8192,
                channel_capacity: 16,
            },
            device: DeviceConfig {
                work_group_size: 256,
                enable_fp64: true,
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration for values no backend can honor
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.partition.partitions == Some(0) {
            errors.push("partition count cannot be zero".to_string());
        }
        if self.partition.chunk_size == 0 {
            errors.push("chunk size cannot be zero".to_string());
        }
        if self.partition.channel_capacity == 0 {
            errors.push("channel capacity cannot be zero".to_string());
        }
        let wg = self.device.work_group_size;
        if wg == 0 || !wg.is_power_of_two() {
            errors.push(format!("work group size must be a power of two, got {}", wg));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = CompilerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.optimizer.fuse);
        assert!(config.partition.preserve_order);
    }

    #[test]
    fn test_presets_validate() {
        assert!(CompilerConfig::unoptimized().validate().is_ok());
        assert!(CompilerConfig::throughput().validate().is_ok());
        assert_eq!(CompilerConfig::unoptimized().optimizer.max_passes, 0);
    }

    #[test]
    fn test_partial_json() {
        let config =
            CompilerConfig::from_json(r#"{"partition": {"partitions": 3}}"#).unwrap();
        assert_eq!(config.partition.partitions, Some(3));
        assert_eq!(config.partition.chunk_size, 1024);
        assert_eq!(config.device, DeviceConfig::default());
    }

    #[test]
    fn test_invalid_configuration() {
        let err = CompilerConfig::from_json(r#"{"device": {"work_group_size": 48}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = CompilerConfig::from_json(r#"{"partition": {"partitions": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("partition count"));
    }

    #[test]
    fn test_json_round_trip() {
        let config = CompilerConfig::throughput();
        let json = config.to_json().unwrap();
        assert_eq!(CompilerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_effective_partitions() {
        let mut config = PartitionConfig::default();
        assert!(config.effective_partitions() >= 1);
        config.partitions = Some(5);
        assert_eq!(config.effective_partitions(), 5);
    }
}
