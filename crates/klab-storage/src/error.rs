// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Storage error types

use klab_geometry::GeometryError;

use crate::StorageType;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Request spans more than one varying extent, several time steps, or a
    /// region outside the storage geometry
    #[error("Unsupported partial access: {0}")]
    UnsupportedPartialAccess(String),

    #[error("Unexpected filler type requested for buffer: storage is {storage}, requested {requested}")]
    IllegalFillerType {
        storage: StorageType,
        requested: StorageType,
    },

    #[error("Value {value} cannot be stored in a {storage} buffer")]
    ValueMismatch { storage: StorageType, value: String },

    #[error("Offset {offset} out of bounds for buffer of size {size}")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage properties: {0}")]
    InvalidProperties(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("Storage manager is closed")]
    Closed,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
