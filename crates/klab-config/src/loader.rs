// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! Three tiers, later tiers win:
//! 1. TOML file (base values)
//! 2. Environment variables
//! 3. CLI arguments

use crate::{validate_config, ConfigError, ConfigResult, KlabConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "klab_configuration.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "KLAB_CONFIG_PATH";

/// Find the configuration file
///
/// Search order:
/// 1. `KLAB_CONFIG_PATH` environment variable
/// 2. Current working directory
/// 3. Up to 5 parent directories
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by {} not found: {}",
            CONFIG_PATH_ENV,
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        let mut current = cwd.as_path();
        for _ in 0..5 {
            match current.parent() {
                Some(parent) => {
                    search_paths.push(parent.join(CONFIG_FILE_NAME));
                    current = parent;
                }
                None => break,
            }
        }
    }

    if let Some(found) = search_paths.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "'{}' not found in any of these locations:\n{}\n\nSet {} to specify a custom location.",
        CONFIG_FILE_NAME, search_list, CONFIG_PATH_ENV
    )))
}

/// Load, override and validate the configuration
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, the file is searched for.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if the file is missing, contains invalid TOML, or fails validation
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<KlabConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: KlabConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);
    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    validate_config(&config)?;
    info!(target: "klab-config", "Loaded configuration from {}", config_file.display());
    Ok(config)
}

fn parse_flag(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "true" || value == "1" || value == "yes"
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `KLAB_PARALLELISM` -> `runtime.parallelism`
/// - `KLAB_SCRATCH_DIR` -> `storage.scratch_dir`
/// - `KLAB_HISTOGRAM_BINS` -> `storage.histogram_bins`
/// - `KLAB_RECORD_HISTOGRAM` -> `storage.record_histogram`
/// - `KLAB_LOG_LEVEL` -> `logging.level`
pub fn apply_environment_overrides(config: &mut KlabConfig) {
    if let Ok(value) = env::var("KLAB_PARALLELISM") {
        if let Ok(parallelism) = value.parse::<usize>() {
            config.runtime.parallelism = parallelism;
        }
    }
    if let Ok(value) = env::var("KLAB_SCRATCH_DIR") {
        config.storage.scratch_dir = PathBuf::from(value);
    }
    if let Ok(value) = env::var("KLAB_HISTOGRAM_BINS") {
        if let Ok(bins) = value.parse::<usize>() {
            config.storage.histogram_bins = bins;
        }
    }
    if let Ok(value) = env::var("KLAB_RECORD_HISTOGRAM") {
        config.storage.record_histogram = parse_flag(&value);
    }
    if let Ok(value) = env::var("KLAB_LOG_LEVEL") {
        config.logging.level = value;
    }
    debug!(target: "klab-config", "Environment overrides applied");
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - CLI arguments, e.g. `{"parallelism": "8", "log_level": "debug"}`
pub fn apply_cli_overrides(config: &mut KlabConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("parallelism") {
        if let Ok(parallelism) = value.parse::<usize>() {
            config.runtime.parallelism = parallelism;
        }
    }
    if let Some(value) = cli_args.get("scratch_dir") {
        config.storage.scratch_dir = PathBuf::from(value);
    }
    if let Some(value) = cli_args.get("histogram_bins") {
        if let Ok(bins) = value.parse::<usize>() {
            config.storage.histogram_bins = bins;
        }
    }
    if let Some(value) = cli_args.get("record_histogram") {
        config.storage.record_histogram = parse_flag(value);
    }
    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.clone();
    }
}
