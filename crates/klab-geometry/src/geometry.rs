// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Observation geometry
//!
//! A geometry is an ordered list of dimensions. Coordinates used by curves
//! and cursors are always relative to each dimension's `start`, so a time
//! slice of a larger geometry indexes from zero.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{GeometryError, GeometryResult};

/// Semantic kind of a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionKind {
    Space,
    Time,
    Other,
}

impl DimensionKind {
    fn code(self) -> char {
        match self {
            DimensionKind::Space => 'S',
            DimensionKind::Time => 'T',
            DimensionKind::Other => 'O',
        }
    }
}

/// One named axis of a geometry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    /// First index covered, relative to the enclosing context
    pub start: u64,
    /// Number of elements, always >= 1
    pub extent: u64,
}

impl Dimension {
    pub fn new(name: impl Into<String>, kind: DimensionKind, extent: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            start: 0,
            extent,
        }
    }

    pub fn space(name: impl Into<String>, extent: u64) -> Self {
        Self::new(name, DimensionKind::Space, extent)
    }

    pub fn time(extent: u64) -> Self {
        Self::new("time", DimensionKind::Time, extent)
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn is_varying(&self) -> bool {
        self.extent > 1
    }

    /// One past the last absolute index
    pub fn end(&self) -> u64 {
        self.start + self.extent
    }
}

/// Immutable multi-dimensional extent of an observation
///
/// Total size is the product of all extents. Construct once and share with
/// [`Geometry::shared`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    dimensions: Vec<Dimension>,
}

impl Geometry {
    /// Build a geometry, rejecting zero extents and duplicate names.
    pub fn new(dimensions: Vec<Dimension>) -> GeometryResult<Self> {
        for (i, dim) in dimensions.iter().enumerate() {
            if dim.extent == 0 {
                return Err(GeometryError::InvalidDimension(format!(
                    "dimension '{}' has zero extent",
                    dim.name
                )));
            }
            if dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(GeometryError::InvalidDimension(format!(
                    "duplicate dimension name '{}'",
                    dim.name
                )));
            }
        }
        if dimensions.iter().filter(|d| d.kind == DimensionKind::Time).count() > 1 {
            return Err(GeometryError::InvalidDimension(
                "at most one time dimension is allowed".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    /// Geometry with no dimensions (a single scalar element)
    pub fn scalar() -> Self {
        Self {
            dimensions: Vec::new(),
        }
    }

    /// 1-D spatial geometry of `n` elements
    pub fn linear(n: u64) -> GeometryResult<Self> {
        Self::new(vec![Dimension::space("x", n)])
    }

    /// 2-D spatial grid `nx` × `ny`
    pub fn grid(nx: u64, ny: u64) -> GeometryResult<Self> {
        Self::new(vec![Dimension::space("x", nx), Dimension::space("y", ny)])
    }

    /// 3-D spatial block `nx` × `ny` × `nz`
    pub fn cube(nx: u64, ny: u64, nz: u64) -> GeometryResult<Self> {
        Self::new(vec![
            Dimension::space("x", nx),
            Dimension::space("y", ny),
            Dimension::space("z", nz),
        ])
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn extents(&self) -> Vec<u64> {
        self.dimensions.iter().map(|d| d.extent).collect()
    }

    /// Total addressable size (multiplicity)
    pub fn size(&self) -> u64 {
        self.dimensions.iter().map(|d| d.extent).product()
    }

    pub fn time(&self) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.kind == DimensionKind::Time)
    }

    /// Number of time steps (1 when there is no time dimension)
    pub fn time_extent(&self) -> u64 {
        self.time().map_or(1, |t| t.extent)
    }

    /// Size of one time slice
    pub fn slice_size(&self) -> u64 {
        self.size() / self.time_extent()
    }

    pub fn spatial_dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions
            .iter()
            .filter(|d| d.kind == DimensionKind::Space)
    }

    /// Product of the spatial extents
    pub fn spatial_size(&self) -> u64 {
        self.spatial_dimensions().map(|d| d.extent).product()
    }

    /// Indices of dimensions with extent > 1, in declaration order
    pub fn varying_dimensions(&self) -> Vec<usize> {
        self.dimensions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_varying())
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of varying extents, counting all spatial axes as one extent
    pub fn varying_extents(&self) -> usize {
        let spatial = usize::from(self.spatial_dimensions().any(Dimension::is_varying));
        let others = self
            .dimensions
            .iter()
            .filter(|d| d.kind != DimensionKind::Space && d.is_varying())
            .count();
        spatial + others
    }

    /// True if `self` has the same axes as `other` and every range lies
    /// within the corresponding range of `other`. Spatial ranges must match
    /// exactly (phase alignment); only non-spatial axes may be narrower.
    pub fn is_contained_in(&self, other: &Geometry) -> bool {
        if self.dimensions.len() != other.dimensions.len() {
            return false;
        }
        self.dimensions
            .iter()
            .zip(other.dimensions.iter())
            .all(|(mine, theirs)| {
                mine.name == theirs.name
                    && mine.kind == theirs.kind
                    && match mine.kind {
                        DimensionKind::Space => {
                            mine.start == theirs.start && mine.extent == theirs.extent
                        }
                        _ => mine.start >= theirs.start && mine.end() <= theirs.end(),
                    }
            })
    }

    /// One time step of this geometry starting at absolute time index `start`
    pub fn time_slice(&self, start: u64) -> GeometryResult<Geometry> {
        let mut dimensions = self.dimensions.clone();
        if let Some(time) = dimensions.iter_mut().find(|d| d.kind == DimensionKind::Time) {
            if start < time.start || start >= time.end() {
                return Err(GeometryError::CoordinateOutOfBounds {
                    dimension: 0,
                    coordinate: start,
                    extent: time.extent,
                });
            }
            time.start = start;
            time.extent = 1;
        }
        Ok(Geometry { dimensions })
    }

    /// Start of the time axis (0 for timeless geometries)
    pub fn time_start(&self) -> u64 {
        self.time().map_or(0, |t| t.start)
    }

    /// Strides for first-dimension-slowest linear ordering
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.dimensions.len()];
        for i in (0..self.dimensions.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dimensions[i + 1].extent;
        }
        strides
    }

    /// Linear offset of relative coordinates, first dimension slowest
    pub fn element_offset(&self, coordinates: &[u64]) -> GeometryResult<u64> {
        self.check_coordinates(coordinates)?;
        Ok(coordinates
            .iter()
            .zip(self.strides())
            .map(|(c, s)| c * s)
            .sum())
    }

    /// Relative coordinates of a linear offset, first dimension slowest
    pub fn element_indices(&self, offset: u64) -> GeometryResult<Vec<u64>> {
        let size = self.size();
        if offset >= size {
            return Err(GeometryError::OffsetOutOfBounds { offset, size });
        }
        let mut remaining = offset;
        Ok(self
            .strides()
            .into_iter()
            .map(|stride| {
                let index = remaining / stride;
                remaining %= stride;
                index
            })
            .collect())
    }

    pub(crate) fn check_coordinates(&self, coordinates: &[u64]) -> GeometryResult<()> {
        if coordinates.len() != self.dimensions.len() {
            return Err(GeometryError::ArityMismatch {
                expected: self.dimensions.len(),
                found: coordinates.len(),
            });
        }
        for (i, (c, d)) in coordinates.iter().zip(&self.dimensions).enumerate() {
            if *c >= d.extent {
                return Err(GeometryError::CoordinateOutOfBounds {
                    dimension: i,
                    coordinate: *c,
                    extent: d.extent,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Geometry {
    /// Compact form, e.g. `S(x:10,y:20)T(time:0+1)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dimensions.is_empty() {
            return write!(f, "#");
        }
        for d in &self.dimensions {
            if d.start > 0 || d.kind == DimensionKind::Time {
                write!(f, "{}({}:{}+{})", d.kind.code(), d.name, d.start, d.extent)?;
            } else {
                write!(f, "{}({}:{})", d.kind.code(), d.name, d.extent)?;
            }
        }
        Ok(())
    }
}
