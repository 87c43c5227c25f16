// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-storage
//!
//! Typed, geometry-indexed storage for quality observations.
//!
//! ## Architecture
//!
//! - [`StorageManager`]: one per service; owns the scratch directory, the
//!   per-type memory-mapped backing files and the persisted buffer-id counter
//! - [`Storage`]: all values of one observation, organized by time slice
//! - [`Buffer`]: one split of one time slice, filled through a
//!   [`Filler`], [`KeyedFiller`] or [`ValueFiller`]
//! - [`StreamingHistogram`]: bounded-bin summary kept per buffer and merged
//!   per storage
//!
//! Buffers of the same slice cover disjoint curve ranges and map disjoint
//! file regions, so they can be filled from different threads.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod backing;
pub mod buffer;
pub mod error;
pub mod histogram;
pub mod keys;
pub mod manager;
mod properties;
pub mod storage;
pub mod types;

pub use buffer::{Buffer, Element, Filler, KeyedFiller, ValueFiller};
pub use error::{StorageError, StorageResult};
pub use histogram::{HistogramBin, StreamingHistogram};
pub use keys::KeyTable;
pub use manager::StorageManager;
pub use properties::{NEXT_ID_PROPERTY, PROPERTIES_FILE};
pub use storage::{split_sizes, Storage};
pub use types::{Persistence, StorageOptions, StorageType, Value};
pub use types::{ANNOTATION_FILL_CURVE, ANNOTATION_SPLITS, ANNOTATION_TYPE};
