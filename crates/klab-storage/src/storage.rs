// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Per-observation storage
//!
//! Buffers are grouped by time slice in a sorted map keyed by the slice's
//! time start. Slices are created on first request and never replaced; within
//! a slice the storage is split into `splits` buffers along the curve order.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use klab_geometry::{CurveMapping, Geometry, SpaceFillingCurve};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::buffer::{Buffer, BufferLayout};
use crate::keys::KeyTable;
use crate::manager::BufferAllocator;
use crate::{StorageError, StorageOptions, StorageResult, StorageType, StreamingHistogram, Value};

/// Sizes of `splits` consecutive buffers covering `total` elements: all equal
/// to `total / n` except the last, which also takes the remainder. `n` is
/// `splits` clamped to `1..=total`.
pub fn split_sizes(total: u64, splits: usize) -> Vec<u64> {
    let n = (splits as u64).clamp(1, total.max(1));
    let base = total / n;
    let mut sizes = vec![base; n as usize];
    if let Some(last) = sizes.last_mut() {
        *last += total % n;
    }
    sizes
}

struct Slice {
    mapping: CurveMapping,
    buffers: Vec<Arc<Buffer>>,
}

impl Slice {
    /// Buffer holding slice position `position` and the local index in it
    fn locate(&self, position: u64) -> Option<(&Arc<Buffer>, u64)> {
        let i = self.buffers.partition_point(|b| b.offset() <= position);
        let buffer = self.buffers.get(i.checked_sub(1)?)?;
        let local = position - buffer.offset();
        (local < buffer.size()).then_some((buffer, local))
    }
}

/// All values of one quality observation
pub struct Storage {
    observation_urn: String,
    geometry: Arc<Geometry>,
    options: StorageOptions,
    allocator: Arc<BufferAllocator>,
    slices: RwLock<BTreeMap<u64, Slice>>,
    keys: Option<Arc<KeyTable>>,
    cached_histogram: Mutex<Option<StreamingHistogram>>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("observation", &self.observation_urn)
            .field("geometry", &self.geometry.to_string())
            .field("options", &self.options)
            .finish()
    }
}

impl Storage {
    pub(crate) fn new(
        observation_urn: String,
        geometry: Arc<Geometry>,
        options: StorageOptions,
        allocator: Arc<BufferAllocator>,
    ) -> Self {
        let keys = (options.storage_type == StorageType::Keyed).then(|| Arc::new(KeyTable::default()));
        Self {
            observation_urn,
            geometry,
            options,
            allocator,
            slices: RwLock::new(BTreeMap::new()),
            keys,
            cached_histogram: Mutex::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn observation_urn(&self) -> &str {
        &self.observation_urn
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    pub fn storage_type(&self) -> StorageType {
        self.options.storage_type
    }

    pub fn fill_curve(&self) -> SpaceFillingCurve {
        self.options.fill_curve
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Key dictionary for keyed storages
    pub fn keys(&self) -> Option<&Arc<KeyTable>> {
        self.keys.as_ref()
    }

    /// Buffers covering `geometry` in the storage's own curve
    pub fn buffers(&self, geometry: &Geometry) -> StorageResult<Vec<Arc<Buffer>>> {
        self.buffers_with_curve(geometry, self.options.fill_curve)
    }

    /// Buffers covering `geometry`, creating the time slice if absent
    ///
    /// # Errors
    ///
    /// - `UnsupportedPartialAccess` if the request has more than one varying
    ///   extent, more than one time step, is not contained in the storage
    ///   geometry, or asks a split storage for a different curve
    /// - `Geometry(IncompatibleGeometry)` if a curve does not fit the slice
    pub fn buffers_with_curve(
        &self,
        geometry: &Geometry,
        curve: SpaceFillingCurve,
    ) -> StorageResult<Vec<Arc<Buffer>>> {
        if geometry.varying_extents() > 1 {
            return Err(StorageError::UnsupportedPartialAccess(
                "Cannot create or retrieve buffers for more than one varying geometry extent at a time"
                    .to_string(),
            ));
        }
        if geometry.time_extent() != 1 {
            return Err(StorageError::UnsupportedPartialAccess(format!(
                "buffer request spans {} time steps",
                geometry.time_extent()
            )));
        }
        if !geometry.is_contained_in(&self.geometry) {
            return Err(StorageError::UnsupportedPartialAccess(format!(
                "{} is not aligned with storage geometry {}",
                geometry, self.geometry
            )));
        }

        if curve != self.options.fill_curve {
            curve.axes(geometry)?;
        }

        let time_start = geometry.time_start();
        if let Some(slice) = self.slices.read().get(&time_start) {
            if curve != self.options.fill_curve {
                curve.axes(slice.mapping.geometry())?;
            }
            return self.adapt(&slice.buffers, curve);
        }

        let mut slices = self.slices.write();
        let slice = match slices.entry(time_start) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // position tables are only built once per slice
                let mapping = self.options.fill_curve.bind(geometry)?;
                let buffers = self.create_buffers(&mapping, time_start)?;
                self.cached_histogram.lock().take();
                entry.insert(Slice { mapping, buffers })
            }
        };
        self.adapt(&slice.buffers, curve)
    }

    fn adapt(&self, buffers: &[Arc<Buffer>], curve: SpaceFillingCurve) -> StorageResult<Vec<Arc<Buffer>>> {
        if curve != self.options.fill_curve && buffers.len() > 1 {
            return Err(StorageError::UnsupportedPartialAccess(format!(
                "cannot read {} split buffers of {} in {} order",
                buffers.len(),
                self.observation_urn,
                curve
            )));
        }
        Ok(buffers.to_vec())
    }

    fn create_buffers(&self, mapping: &CurveMapping, time_start: u64) -> StorageResult<Vec<Arc<Buffer>>> {
        let sizes = split_sizes(mapping.size(), self.options.splits);
        let mut buffers = Vec::with_capacity(sizes.len());
        let mut offset = 0u64;
        for size in sizes {
            let id = self.allocator.next_buffer_id()?;
            let region = self
                .allocator
                .region(self.options.storage_type, self.options.persistence, size)?;
            let layout = BufferLayout {
                id,
                urn: format!("{}#{}", self.observation_urn, id),
                storage_type: self.options.storage_type,
                offset,
                size,
                mapping: mapping.clone(),
                time_start,
                persistence: self.options.persistence,
                record_histogram: self.allocator.record_histogram(),
                histogram_bins: self.allocator.histogram_bins(),
                keys: self.keys.clone(),
            };
            trace!(target: "klab-storage", "Buffer {} offset {} size {}", layout.urn, offset, size);
            buffers.push(Arc::new(Buffer::new(layout, region)));
            offset += size;
        }
        debug!(
            target: "klab-storage",
            "Created {} {} buffer(s) for {} at t={}",
            buffers.len(),
            self.options.storage_type,
            self.observation_urn,
            time_start
        );
        Ok(buffers)
    }

    /// Every buffer in time order, then split order
    pub fn all_buffers(&self) -> Vec<Arc<Buffer>> {
        self.slices
            .read()
            .values()
            .flat_map(|s| s.buffers.iter().cloned())
            .collect()
    }

    /// Time starts of the slices created so far
    pub fn time_starts(&self) -> Vec<u64> {
        self.slices.read().keys().copied().collect()
    }

    /// Value at slice position `position` (storage curve order)
    pub fn get(&self, time_start: u64, position: u64) -> StorageResult<Value> {
        let slices = self.slices.read();
        let slice = slices.get(&time_start).ok_or(StorageError::InvalidOffset {
            offset: position,
            size: 0,
        })?;
        let (buffer, local) = slice.locate(position).ok_or(StorageError::InvalidOffset {
            offset: position,
            size: slice.mapping.size(),
        })?;
        buffer.get(local)
    }

    /// Value at relative `coordinates` of the slice starting at `time_start`
    pub fn get_at(&self, time_start: u64, coordinates: &[u64]) -> StorageResult<Value> {
        let position = {
            let slices = self.slices.read();
            let slice = slices.get(&time_start).ok_or(StorageError::InvalidOffset {
                offset: time_start,
                size: 0,
            })?;
            slice.mapping.offset(coordinates)?
        };
        self.get(time_start, position)
    }

    /// Merged histogram of all buffers
    ///
    /// Computed on every call unless the storage is finalized, in which case
    /// the first result is cached.
    pub fn histogram(&self) -> StreamingHistogram {
        if let Some(cached) = self.cached_histogram.lock().as_ref() {
            return cached.clone();
        }
        let buffers = self.all_buffers();
        let histogram = match buffers.as_slice() {
            [single] => single.histogram(),
            many => {
                let mut merged = StreamingHistogram::new(self.allocator.histogram_bins());
                for buffer in many {
                    merged.merge(&buffer.histogram());
                }
                merged
            }
        };
        if self.is_finalized() {
            *self.cached_histogram.lock() = Some(histogram.clone());
        }
        histogram
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Mark the storage and all of its buffers immutable
    pub fn finalize(&self) -> StorageResult<()> {
        for buffer in self.all_buffers() {
            buffer.finalize()?;
        }
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}
