// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! Each struct maps to one section of `klab_configuration.toml`. Every
//! section is `#[serde(default)]` so a partial file is always accepted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct KlabConfig {
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Dataflow execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool size and default storage split count. 0 = number of CPUs.
    pub parallelism: usize,
    /// Fail the whole dataflow compile as soon as one actuator fails to compile
    pub fail_fast_compile: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            fail_fast_compile: true,
        }
    }
}

impl RuntimeConfig {
    /// Resolve `parallelism = 0` to the number of available CPUs.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Storage engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the memory-mapped backing files and `storage.properties`
    pub scratch_dir: PathBuf,
    /// Maximum number of bins kept by each streaming histogram
    pub histogram_bins: usize,
    /// Feed histograms on sequential `add`
    pub record_histogram: bool,
    /// Storage type used when the observable does not imply one
    pub default_type: String,
    /// Initial length in bytes of each backing file
    pub mmap_initial_len: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("ktmp"),
            histogram_bins: 20,
            record_histogram: true,
            default_type: "double".to_string(),
            mmap_initial_len: 1 << 20,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub format: LogFormat,
    /// When set, logs are also written under this directory
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_dir: None,
        }
    }
}
