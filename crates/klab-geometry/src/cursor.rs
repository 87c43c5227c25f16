// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Stateful traversal of a geometry
//!
//! A cursor walks positions `start..end` of a curve. A plain cursor yields the
//! positions themselves; a remapping cursor walks the *desired* curve and
//! yields where each visited cell sits in storage written with the
//! *original* curve. Not thread-safe: one cursor per traversal.

use crate::{CurveMapping, Geometry, GeometryError, GeometryResult, SpaceFillingCurve};

#[derive(Debug, Clone)]
pub struct Cursor {
    desired: CurveMapping,
    original: Option<CurveMapping>,
    start: u64,
    end: u64,
    counter: u64,
}

impl Cursor {
    /// Cursor over the whole geometry in `curve` order
    pub fn new(geometry: &Geometry, curve: SpaceFillingCurve) -> GeometryResult<Self> {
        let mapping = curve.bind(geometry)?;
        let end = mapping.size();
        Ok(Self::over(mapping, None, 0, end))
    }

    /// Cursor reading in `desired` order from storage laid out in `original` order
    pub fn remapping(
        geometry: &Geometry,
        desired: SpaceFillingCurve,
        original: SpaceFillingCurve,
    ) -> GeometryResult<Self> {
        let desired = desired.bind(geometry)?;
        let original = original.bind(geometry)?;
        let end = desired.size();
        let original = (original.curve() != desired.curve()).then_some(original);
        Ok(Self::over(desired, original, 0, end))
    }

    /// Cursor over positions `start..start + len` of an already bound curve
    pub fn range(mapping: CurveMapping, start: u64, len: u64) -> GeometryResult<Self> {
        let size = mapping.size();
        if start + len > size {
            return Err(GeometryError::OffsetOutOfBounds {
                offset: start + len,
                size,
            });
        }
        Ok(Self::over(mapping, None, start, start + len))
    }

    fn over(desired: CurveMapping, original: Option<CurveMapping>, start: u64, end: u64) -> Self {
        Self {
            desired,
            original,
            start,
            end,
            counter: start,
        }
    }

    /// Total number of positions this cursor visits
    pub fn multiplicity(&self) -> u64 {
        self.end - self.start
    }

    pub fn has_next(&self) -> bool {
        self.counter < self.end
    }

    /// Next storage position. Callers must check [`has_next`](Self::has_next).
    pub fn next_long(&mut self) -> GeometryResult<u64> {
        if !self.has_next() {
            return Err(GeometryError::OffsetOutOfBounds {
                offset: self.counter,
                size: self.end,
            });
        }
        let position = self.counter;
        self.counter += 1;
        match &self.original {
            Some(original) => self.desired.remap_to(position, original),
            None => Ok(position),
        }
    }

    /// Coordinates of the cell the next call to `next_long` will visit
    pub fn peek_coordinates(&self) -> GeometryResult<Vec<u64>> {
        self.desired.inverse(self.counter)
    }

    /// Rewind to the first position
    pub fn reset(&mut self) {
        self.counter = self.start;
    }

    pub fn curve(&self) -> SpaceFillingCurve {
        self.desired.curve()
    }

    pub fn mapping(&self) -> &CurveMapping {
        &self.desired
    }
}

impl Iterator for Cursor {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.has_next() {
            self.next_long().ok()
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.counter) as usize;
        (remaining, Some(remaining))
    }
}
