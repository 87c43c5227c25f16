// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! All problems are collected before reporting so a user sees every bad
//! value in one pass.

use crate::{ConfigError, ConfigResult, KlabConfig};

/// Upper bound on worker threads
pub const MAX_PARALLELISM: usize = 1024;

/// Storage type names accepted in `storage.default_type`
pub const STORAGE_TYPES: &[&str] = &["double", "float", "integer", "long", "boolean", "keyed"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single validation problem
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &KlabConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_runtime(config, &mut errors);
    validate_storage(config, &mut errors);
    validate_logging(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn validate_runtime(config: &KlabConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.runtime.parallelism > MAX_PARALLELISM {
        errors.push(ConfigValidationError::InvalidValue {
            field: "runtime.parallelism".to_string(),
            reason: format!(
                "{} exceeds the maximum of {}",
                config.runtime.parallelism, MAX_PARALLELISM
            ),
        });
    }
}

fn validate_storage(config: &KlabConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.storage.scratch_dir.as_os_str().is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "storage.scratch_dir".to_string(),
        });
    }
    if config.storage.histogram_bins == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "storage.histogram_bins".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    let default_type = config.storage.default_type.to_lowercase();
    if !STORAGE_TYPES.contains(&default_type.as_str()) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "storage.default_type".to_string(),
            reason: format!(
                "'{}' is not one of {}",
                config.storage.default_type,
                STORAGE_TYPES.join(", ")
            ),
        });
    }
}

fn validate_logging(config: &KlabConfig, errors: &mut Vec<ConfigValidationError>) {
    let level = config.logging.level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!("'{}' is not one of {}", config.logging.level, LOG_LEVELS.join(", ")),
        });
    }
}
