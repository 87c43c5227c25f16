// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Geometry error types

use crate::SpaceFillingCurve;

/// Errors raised synchronously by geometry and curve operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("Curve {curve} needs {expected} varying dimensions, geometry has {found}")]
    IncompatibleGeometry {
        curve: SpaceFillingCurve,
        expected: usize,
        found: usize,
    },

    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("Coordinate {coordinate} out of bounds for dimension {dimension} (extent {extent})")]
    CoordinateOutOfBounds {
        dimension: usize,
        coordinate: u64,
        extent: u64,
    },

    #[error("Offset {offset} out of bounds (size {size})")]
    OffsetOutOfBounds { offset: u64, size: u64 },

    #[error("Expected {expected} coordinates, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("Unknown space-filling curve: {0}")]
    UnknownCurve(String),
}

/// Result type for geometry operations
pub type GeometryResult<T> = Result<T, GeometryError>;
