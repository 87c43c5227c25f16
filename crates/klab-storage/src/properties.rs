// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! `storage.properties`: persisted next-buffer-id counter
//!
//! Java-properties style `key=value` lines; `#` starts a comment. The file
//! is replaced atomically: a sibling `.tmp` file is written, synced and
//! renamed over it, so a reader sees either the old or the new counter.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{StorageError, StorageResult};

pub const PROPERTIES_FILE: &str = "storage.properties";
pub const NEXT_ID_PROPERTY: &str = "storage.mmap.nextid";

/// Read the last allocated buffer id, creating the file with 0 if absent
///
/// # Errors
///
/// `InvalidProperties` if the file exists but holds no parseable counter
pub fn read_counter(path: &Path) -> StorageResult<u64> {
    if !path.exists() {
        write_counter(path, 0)?;
        return Ok(0);
    }
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == NEXT_ID_PROPERTY {
                return value.trim().parse::<u64>().map_err(|_| {
                    StorageError::InvalidProperties(format!(
                        "{} is not an integer: '{}'",
                        NEXT_ID_PROPERTY,
                        value.trim()
                    ))
                });
            }
        }
    }
    Err(StorageError::InvalidProperties(format!(
        "{} has no {} entry",
        path.display(),
        NEXT_ID_PROPERTY
    )))
}

/// Replace the counter on disk
pub fn write_counter(path: &Path, value: u64) -> StorageResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    {
        let mut file = File::create(&staging)?;
        writeln!(file, "# buffer id counter, do not edit while the service runs")?;
        writeln!(file, "{}={}", NEXT_ID_PROPERTY, value)?;
        file.sync_data()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}
