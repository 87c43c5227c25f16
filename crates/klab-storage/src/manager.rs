// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Storage manager
//!
//! One manager per running service/session. It owns the scratch directory,
//! the per-type backing files and the buffer-id counter, and hands out
//! storages keyed by observation URN. Nothing here is a process global:
//! callers pass the manager explicitly.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use klab_config::StorageConfig;
use klab_geometry::Geometry;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backing::{BackingFile, Region};
use crate::properties::{read_counter, write_counter, PROPERTIES_FILE};
use crate::{Persistence, Storage, StorageError, StorageOptions, StorageResult, StorageType};

/// Shared allocation state: backing files and the buffer-id counter
pub(crate) struct BufferAllocator {
    scratch_dir: PathBuf,
    properties_path: PathBuf,
    files: Mutex<AHashMap<&'static str, BackingFile>>,
    last_id: Mutex<u64>,
    histogram_bins: usize,
    record_histogram: bool,
    initial_len: u64,
    closed: AtomicBool,
}

impl BufferAllocator {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Next buffer id; the counter file is rewritten before the id is returned
    pub(crate) fn next_buffer_id(&self) -> StorageResult<u64> {
        self.check_open()?;
        let mut last = self.last_id.lock();
        let id = *last + 1;
        write_counter(&self.properties_path, id)?;
        *last = id;
        debug!(target: "klab-storage", "Allocated buffer id {}", id);
        Ok(id)
    }

    pub(crate) fn region(
        &self,
        storage_type: StorageType,
        persistence: Persistence,
        elements: u64,
    ) -> StorageResult<Region> {
        self.check_open()?;
        let bytes = elements as usize * storage_type.width();
        if !persistence.is_durable() {
            return Region::anonymous(bytes);
        }
        let mut files = self.files.lock();
        let name = storage_type.backing_file();
        let file = match files.entry(name) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(BackingFile::create(&self.scratch_dir.join(name), self.initial_len)?)
            }
        };
        file.allocate(bytes)
    }

    pub(crate) fn histogram_bins(&self) -> usize {
        self.histogram_bins
    }

    pub(crate) fn record_histogram(&self) -> bool {
        self.record_histogram
    }
}

/// Owner of all storages of one service instance
pub struct StorageManager {
    instance_id: Uuid,
    allocator: Arc<BufferAllocator>,
    storages: RwLock<AHashMap<String, Arc<Storage>>>,
    parallelism: usize,
    default_type: StorageType,
}

impl StorageManager {
    /// Open the manager on `config.scratch_dir`
    ///
    /// Creates the directory if needed and reads (or initializes)
    /// `storage.properties` so buffer ids continue from the last run.
    pub fn open(config: &StorageConfig, parallelism: usize) -> StorageResult<Self> {
        fs::create_dir_all(&config.scratch_dir)?;
        let properties_path = config.scratch_dir.join(PROPERTIES_FILE);
        let last_id = read_counter(&properties_path)?;
        let default_type = config.default_type.parse()?;
        let instance_id = Uuid::now_v7();

        info!(
            target: "klab-storage",
            "Storage manager {} opened in {} (last buffer id {}, {} split(s))",
            instance_id,
            config.scratch_dir.display(),
            last_id,
            parallelism.max(1)
        );

        Ok(Self {
            instance_id,
            allocator: Arc::new(BufferAllocator {
                scratch_dir: config.scratch_dir.clone(),
                properties_path,
                files: Mutex::new(AHashMap::new()),
                last_id: Mutex::new(last_id),
                histogram_bins: config.histogram_bins.max(1),
                record_histogram: config.record_histogram,
                initial_len: config.mmap_initial_len,
                closed: AtomicBool::new(false),
            }),
            storages: RwLock::new(AHashMap::new()),
            parallelism: parallelism.max(1),
            default_type,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.allocator.scratch_dir
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn default_type(&self) -> StorageType {
        self.default_type
    }

    /// Default layout for a storage over `geometry`
    pub fn default_options(&self, geometry: &Geometry, storage_type: Option<StorageType>) -> StorageOptions {
        StorageOptions::new(storage_type.unwrap_or(self.default_type), geometry, self.parallelism)
    }

    /// Default layout overridden by a `storage` annotation
    pub fn options_with_annotations(
        &self,
        geometry: &Geometry,
        storage_type: Option<StorageType>,
        annotations: &HashMap<String, String>,
    ) -> StorageResult<StorageOptions> {
        self.default_options(geometry, storage_type)
            .with_annotations(annotations)
    }

    /// Storage for `observation_urn`, created on first request
    ///
    /// Options are only used when the storage does not exist yet.
    pub fn storage(
        &self,
        observation_urn: &str,
        geometry: Arc<Geometry>,
        options: StorageOptions,
    ) -> StorageResult<Arc<Storage>> {
        self.allocator.check_open()?;
        if let Some(existing) = self.storages.read().get(observation_urn) {
            return Ok(existing.clone());
        }
        let mut storages = self.storages.write();
        let storage = storages
            .entry(observation_urn.to_string())
            .or_insert_with(|| {
                debug!(
                    target: "klab-storage",
                    "New {} storage for {} ({}, curve {}, {} split(s))",
                    options.storage_type,
                    observation_urn,
                    geometry,
                    options.fill_curve,
                    options.splits
                );
                Arc::new(Storage::new(
                    observation_urn.to_string(),
                    geometry,
                    options,
                    self.allocator.clone(),
                ))
            });
        Ok(storage.clone())
    }

    pub fn get(&self, observation_urn: &str) -> Option<Arc<Storage>> {
        self.storages.read().get(observation_urn).cloned()
    }

    /// Forget a storage (context end). Backing regions are reclaimed at close.
    pub fn release(&self, observation_urn: &str) -> Option<Arc<Storage>> {
        self.storages.write().remove(observation_urn)
    }

    pub fn storage_count(&self) -> usize {
        self.storages.read().len()
    }

    /// Allocate a buffer id outside of storage creation
    pub fn next_buffer_id(&self) -> StorageResult<u64> {
        self.allocator.next_buffer_id()
    }

    /// Last id handed out (0 if none ever)
    pub fn last_buffer_id(&self) -> u64 {
        *self.allocator.last_id.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.allocator.closed.load(Ordering::Acquire)
    }

    /// Shut down: drop all storages and delete the backing files.
    /// `storage.properties` is kept so ids keep increasing after restart.
    pub fn close(&self) -> StorageResult<()> {
        if self.allocator.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.storages.write().clear();
        let files: Vec<BackingFile> = self.allocator.files.lock().drain().map(|(_, f)| f).collect();
        let mut first_error = None;
        for file in files {
            let path = file.path().to_path_buf();
            drop(file);
            if let Err(e) = fs::remove_file(&path) {
                warn!(target: "klab-storage", "Failed to delete backing file {}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
        info!(target: "klab-storage", "Storage manager {} closed", self.instance_id);
        match first_error {
            Some(e) => Err(StorageError::Io(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig {
            scratch_dir: dir.join("ktmp"),
            mmap_initial_len: 64,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_ids_survive_restart() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let manager = StorageManager::open(&cfg, 1).unwrap();
            assert_eq!(manager.next_buffer_id().unwrap(), 1);
            assert_eq!(manager.next_buffer_id().unwrap(), 2);
            manager.close().unwrap();
        }
        let manager = StorageManager::open(&cfg, 1).unwrap();
        assert_eq!(manager.last_buffer_id(), 2);
        assert_eq!(manager.next_buffer_id().unwrap(), 3);
    }

    #[test]
    fn test_storage_is_cached_per_urn() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(&config(dir.path()), 2).unwrap();
        let geometry = Geometry::linear(10).unwrap().shared();
        let options = manager.default_options(&geometry, None);
        let a = manager.storage("local:ctx.1", geometry.clone(), options.clone()).unwrap();
        let b = manager.storage("local:ctx.1", geometry, options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.storage_count(), 1);
        assert_eq!(a.options().splits, 2);
    }

    #[test]
    fn test_close_deletes_backing_files() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let manager = StorageManager::open(&cfg, 1).unwrap();
        let geometry = Geometry::linear(4).unwrap().shared();
        let storage = manager
            .storage("local:ctx.2", geometry.clone(), manager.default_options(&geometry, None))
            .unwrap();
        storage.buffers(&geometry).unwrap();
        let data_file = cfg.scratch_dir.join("dstorage.bin");
        assert!(data_file.exists());

        manager.close().unwrap();
        assert!(!data_file.exists());
        assert!(cfg.scratch_dir.join(PROPERTIES_FILE).exists());
        assert!(matches!(manager.next_buffer_id(), Err(StorageError::Closed)));
        assert!(manager.get("local:ctx.2").is_none());
    }

    #[test]
    fn test_transient_buffers_skip_backing_file() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let manager = StorageManager::open(&cfg, 1).unwrap();
        let geometry = Geometry::linear(4).unwrap().shared();
        let options = manager
            .default_options(&geometry, Some(StorageType::Long))
            .with_persistence(Persistence::Transient);
        let storage = manager.storage("local:ctx.3", geometry.clone(), options).unwrap();
        let buffers = storage.buffers(&geometry).unwrap();
        assert_eq!(buffers[0].persistence(), Persistence::Transient);
        assert!(!cfg.scratch_dir.join("lstorage.bin").exists());
    }

    #[test]
    fn test_unknown_default_type_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.default_type = "complex".to_string();
        assert!(StorageManager::open(&cfg, 1).is_err());
    }
}
