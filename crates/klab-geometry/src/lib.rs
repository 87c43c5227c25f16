// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-geometry
//!
//! Multi-dimensional observation geometry and the space-filling curves that
//! linearize it for storage.
//!
//! - [`Geometry`]: ordered named dimensions, immutable, shared via `Arc`
//! - [`SpaceFillingCurve`] / [`CurveMapping`]: `offset`/`inverse` pairs
//! - [`Cursor`]: stateful traversal, optionally remapping between two curves

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod curve;
pub mod cursor;
pub mod error;
pub mod geometry;

pub use curve::{CurveMapping, SpaceFillingCurve};
pub use cursor::Cursor;
pub use error::{GeometryError, GeometryResult};
pub use geometry::{Dimension, DimensionKind, Geometry};
