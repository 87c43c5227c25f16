// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Space-filling curves
//!
//! A [`CurveMapping`] binds a [`SpaceFillingCurve`] to one geometry and
//! exposes the `offset`/`inverse` bijection between relative coordinates and
//! storage positions `0..size`.
//!
//! Hilbert, Morton and ternary curves are defined on power-of-base squares.
//! For arbitrary rectangles every cell is keyed on the enclosing square and
//! positions are the rank of that key, which keeps the mapping a bijection on
//! `0..nx*ny` while preserving the curve's visiting order.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{DimensionKind, Geometry, GeometryError, GeometryResult};

/// Supported linearizations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceFillingCurve {
    /// First dimension slowest, any number of dimensions
    Linear,
    /// Row-major with X fastest
    D2Xy,
    /// Row-major with Y fastest
    D2Yx,
    /// Ternary 3×3 recursive serpentine
    D2Sierpinski3,
    D2Hilbert,
    /// Z-order (bit interleave)
    D2Morton,
    /// X fastest, then Y, then Z
    D3Xyz,
}

impl SpaceFillingCurve {
    pub const ALL: [SpaceFillingCurve; 7] = [
        SpaceFillingCurve::Linear,
        SpaceFillingCurve::D2Xy,
        SpaceFillingCurve::D2Yx,
        SpaceFillingCurve::D2Sierpinski3,
        SpaceFillingCurve::D2Hilbert,
        SpaceFillingCurve::D2Morton,
        SpaceFillingCurve::D3Xyz,
    ];

    /// Number of varying dimensions the curve requires, `None` if unconstrained
    pub fn required_dimensions(self) -> Option<usize> {
        match self {
            SpaceFillingCurve::Linear => None,
            SpaceFillingCurve::D3Xyz => Some(3),
            _ => Some(2),
        }
    }

    /// Curve used when nothing else is requested: linear unless the
    /// geometry has a 2-D or 3-D spatial extent.
    pub fn default_for(geometry: &Geometry) -> Self {
        if geometry.spatial_size() <= 1 {
            return SpaceFillingCurve::Linear;
        }
        // slices keep every varying non-temporal axis, so those must all be spatial
        if geometry
            .dimensions()
            .iter()
            .any(|d| d.kind == DimensionKind::Other && d.is_varying())
        {
            return SpaceFillingCurve::Linear;
        }
        match geometry.spatial_dimensions().filter(|d| d.is_varying()).count() {
            2 => SpaceFillingCurve::D2Xy,
            3 => SpaceFillingCurve::D3Xyz,
            _ => SpaceFillingCurve::Linear,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpaceFillingCurve::Linear => "linear",
            SpaceFillingCurve::D2Xy => "xy",
            SpaceFillingCurve::D2Yx => "yx",
            SpaceFillingCurve::D2Sierpinski3 => "sierpinski3",
            SpaceFillingCurve::D2Hilbert => "hilbert",
            SpaceFillingCurve::D2Morton => "morton",
            SpaceFillingCurve::D3Xyz => "xyz",
        }
    }

    /// Bind the curve to a geometry
    pub fn bind(self, geometry: &Geometry) -> GeometryResult<CurveMapping> {
        CurveMapping::new(self, geometry)
    }

    /// Varying dimensions the curve walks in `geometry`, without building
    /// any position table
    ///
    /// # Errors
    ///
    /// `IncompatibleGeometry` when the curve needs a fixed number of varying
    /// dimensions and the geometry has a different count.
    pub fn axes(self, geometry: &Geometry) -> GeometryResult<Vec<usize>> {
        let varying = geometry.varying_dimensions();
        match self.required_dimensions() {
            None => Ok(Vec::new()),
            Some(expected) if expected == varying.len() => Ok(varying),
            Some(expected) => Err(GeometryError::IncompatibleGeometry {
                curve: self,
                expected,
                found: varying.len(),
            }),
        }
    }
}

impl fmt::Display for SpaceFillingCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpaceFillingCurve {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        SpaceFillingCurve::ALL
            .into_iter()
            .find(|c| c.name() == wanted)
            .ok_or_else(|| GeometryError::UnknownCurve(s.to_string()))
    }
}

/// Position tables for curves defined through a cell key
#[derive(Debug)]
struct RankTable {
    /// canonical cell index (x + y*nx) -> position
    forward: Vec<u64>,
    /// position -> canonical cell index
    inverse: Vec<u64>,
}

impl RankTable {
    fn build(nx: u64, ny: u64, key: impl Fn(u64, u64) -> u64) -> Self {
        let n = (nx * ny) as usize;
        let mut keyed: Vec<(u64, u64)> = (0..nx * ny).map(|i| (key(i % nx, i / nx), i)).collect();
        keyed.sort_unstable();
        let mut forward = vec![0u64; n];
        let mut inverse = vec![0u64; n];
        for (position, (_, cell)) in keyed.into_iter().enumerate() {
            forward[cell as usize] = position as u64;
            inverse[position] = cell;
        }
        Self { forward, inverse }
    }
}

/// A curve bound to the extents of one geometry
///
/// Cheap to clone; rank tables are shared.
#[derive(Debug, Clone)]
pub struct CurveMapping {
    curve: SpaceFillingCurve,
    geometry: Geometry,
    /// Indices of the dimensions the curve walks (X, Y[, Z])
    axes: Vec<usize>,
    table: Option<Arc<RankTable>>,
}

impl CurveMapping {
    /// Bind `curve` to `geometry`
    ///
    /// # Errors
    ///
    /// `IncompatibleGeometry` when the curve needs a fixed number of varying
    /// dimensions and the geometry has a different count.
    pub fn new(curve: SpaceFillingCurve, geometry: &Geometry) -> GeometryResult<Self> {
        let axes = curve.axes(geometry)?;

        let table = match curve {
            SpaceFillingCurve::D2Hilbert | SpaceFillingCurve::D2Morton | SpaceFillingCurve::D2Sierpinski3 => {
                let dims = geometry.dimensions();
                let (nx, ny) = (dims[axes[0]].extent, dims[axes[1]].extent);
                trace!(target: "klab-geometry", "Building {} rank table for {}x{}", curve, nx, ny);
                let table = match curve {
                    SpaceFillingCurve::D2Hilbert => {
                        let side = enclosing_side(nx.max(ny), 2);
                        RankTable::build(nx, ny, |x, y| hilbert_key(side, x, y))
                    }
                    SpaceFillingCurve::D2Morton => RankTable::build(nx, ny, morton_key),
                    _ => {
                        let levels = levels_for(nx.max(ny), 3);
                        RankTable::build(nx, ny, |x, y| ternary_key(levels, x, y))
                    }
                };
                Some(Arc::new(table))
            }
            _ => None,
        };

        Ok(Self {
            curve,
            geometry: geometry.clone(),
            axes,
            table,
        })
    }

    pub fn curve(&self) -> SpaceFillingCurve {
        self.curve
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn size(&self) -> u64 {
        self.geometry.size()
    }

    fn extent(&self, axis: usize) -> u64 {
        self.geometry.dimensions()[self.axes[axis]].extent
    }

    /// Storage position of relative `coordinates`
    pub fn offset(&self, coordinates: &[u64]) -> GeometryResult<u64> {
        self.geometry.check_coordinates(coordinates)?;
        if self.curve == SpaceFillingCurve::Linear {
            return self.geometry.element_offset(coordinates);
        }
        let c = |axis: usize| coordinates[self.axes[axis]];
        let nx = self.extent(0);
        let offset = match self.curve {
            SpaceFillingCurve::D2Xy => c(0) + c(1) * nx,
            SpaceFillingCurve::D2Yx => c(1) + c(0) * self.extent(1),
            SpaceFillingCurve::D3Xyz => c(0) + nx * (c(1) + self.extent(1) * c(2)),
            _ => self.ranked(c(0) + c(1) * nx),
        };
        Ok(offset)
    }

    /// Relative coordinates of storage position `offset`
    pub fn inverse(&self, offset: u64) -> GeometryResult<Vec<u64>> {
        let size = self.size();
        if offset >= size {
            return Err(GeometryError::OffsetOutOfBounds { offset, size });
        }
        if self.curve == SpaceFillingCurve::Linear {
            return self.geometry.element_indices(offset);
        }
        let mut coordinates = vec![0u64; self.geometry.rank()];
        let nx = self.extent(0);
        let walked: Vec<u64> = match self.curve {
            SpaceFillingCurve::D2Xy => vec![offset % nx, offset / nx],
            SpaceFillingCurve::D2Yx => {
                let ny = self.extent(1);
                vec![offset / ny, offset % ny]
            }
            SpaceFillingCurve::D3Xyz => {
                let ny = self.extent(1);
                vec![offset % nx, (offset / nx) % ny, offset / (nx * ny)]
            }
            _ => {
                let cell = self.unranked(offset);
                vec![cell % nx, cell / nx]
            }
        };
        for (axis, value) in walked.into_iter().enumerate() {
            coordinates[self.axes[axis]] = value;
        }
        Ok(coordinates)
    }

    /// Map a position in this curve to the same cell's position in `other`
    pub fn remap_to(&self, offset: u64, other: &CurveMapping) -> GeometryResult<u64> {
        other.offset(&self.inverse(offset)?)
    }

    fn ranked(&self, cell: u64) -> u64 {
        self.table
            .as_ref()
            .map_or(cell, |t| t.forward[cell as usize])
    }

    fn unranked(&self, position: u64) -> u64 {
        self.table
            .as_ref()
            .map_or(position, |t| t.inverse[position as usize])
    }
}

fn enclosing_side(n: u64, base: u64) -> u64 {
    let mut side = 1;
    while side < n {
        side *= base;
    }
    side
}

fn levels_for(n: u64, base: u64) -> u32 {
    let mut levels = 0;
    let mut side = 1;
    while side < n {
        side *= base;
        levels += 1;
    }
    levels
}

/// Hilbert index of (x, y) in a `side`×`side` square, `side` a power of two
fn hilbert_key(side: u64, mut x: u64, mut y: u64) -> u64 {
    let mut d = 0;
    let mut s = side / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = side - 1 - x;
                y = side - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// Z-order key: interleave bits of x (even) and y (odd)
fn morton_key(x: u64, y: u64) -> u64 {
    let mut key = 0u64;
    for i in 0..32 {
        key |= ((x >> i) & 1) << (2 * i) | ((y >> i) & 1) << (2 * i + 1);
    }
    key
}

/// Ternary serpentine key over `levels` 3×3 subdivisions
fn ternary_key(levels: u32, x: u64, y: u64) -> u64 {
    let mut key = 0u64;
    let (mut flip_x, mut flip_y) = (false, false);
    for level in (0..levels).rev() {
        let scale = 3u64.pow(level);
        let mut a = (x / scale) % 3;
        let mut b = (y / scale) % 3;
        if flip_x {
            a = 2 - a;
        }
        if flip_y {
            b = 2 - b;
        }
        let cell = 3 * a + if a % 2 == 1 { 2 - b } else { b };
        key = key * 9 + cell;
        if a % 2 == 1 {
            flip_y = !flip_y;
        }
        if b % 2 == 1 {
            flip_x = !flip_x;
        }
    }
    key
}
