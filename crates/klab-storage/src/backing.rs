// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Memory-mapped backing files
//!
//! One scratch file per primitive type. Buffers receive their own mapping of
//! a disjoint region, so writers on different buffers never share a lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::StorageResult;

const REGION_ALIGNMENT: u64 = 8;

/// Mapped bytes owned by one buffer
pub struct Region {
    map: MmapMut,
    file_offset: Option<u64>,
}

impl Region {
    /// Anonymous (transient) region
    pub fn anonymous(bytes: usize) -> StorageResult<Self> {
        Ok(Self {
            map: MmapMut::map_anon(bytes.max(REGION_ALIGNMENT as usize))?,
            file_offset: None,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Offset in the backing file, `None` for anonymous regions
    pub fn file_offset(&self) -> Option<u64> {
        self.file_offset
    }

    pub fn flush(&self) -> StorageResult<()> {
        if self.file_offset.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }
}

/// Bump-allocated scratch file
pub struct BackingFile {
    path: PathBuf,
    file: File,
    allocated: u64,
    len: u64,
}

impl BackingFile {
    /// Create (truncating) the file at `path`, pre-sized to `initial_len` bytes
    pub fn create(path: &Path, initial_len: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_len)?;
        debug!(target: "klab-storage", "Created backing file {} ({} bytes)", path.display(), initial_len);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            allocated: 0,
            len: initial_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes handed out so far
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Reserve `bytes` and map them
    pub fn allocate(&mut self, bytes: usize) -> StorageResult<Region> {
        let bytes = (bytes as u64).max(REGION_ALIGNMENT);
        let offset = self.allocated.div_ceil(REGION_ALIGNMENT) * REGION_ALIGNMENT;
        let end = offset + bytes;
        if end > self.len {
            let new_len = end.max(self.len.saturating_mul(2));
            self.file.set_len(new_len)?;
            debug!(target: "klab-storage", "Grew {} to {} bytes", self.path.display(), new_len);
            self.len = new_len;
        }
        self.allocated = end;

        // SAFETY: the region [offset, end) is handed out exactly once and the
        // file is only ever grown, never truncated, while the manager is open.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(bytes as usize)
                .map_mut(&self.file)?
        };
        Ok(Region {
            map,
            file_offset: Some(offset),
        })
    }
}
