// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Buffers and fillers
//!
//! A [`Buffer`] holds one split of one time slice of a storage. Values are
//! written sequentially through a filler (`add`, which feeds the buffer's own
//! histogram) or at explicit positions through `set` (no histogram update,
//! for corrections only). Once every position has been filled by `add` the
//! buffer is finalized.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use klab_geometry::{CurveMapping, Cursor, Geometry, SpaceFillingCurve};
use parking_lot::Mutex;

use crate::backing::Region;
use crate::keys::KeyTable;
use crate::{Persistence, StorageError, StorageResult, StorageType, StreamingHistogram, Value};

const MISSING_BOOLEAN: u8 = 0xFF;
const MISSING_KEY: i32 = -1;

/// Primitive types a typed filler can write
pub trait Element: Copy + Send + 'static {
    const TYPE: StorageType;

    fn encode(self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
    fn to_value(self) -> Value;
}

impl Element for f64 {
    const TYPE: StorageType = StorageType::Double;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_le_bytes(raw)
    }

    fn to_value(self) -> Value {
        if self.is_nan() {
            Value::Missing
        } else {
            Value::Double(self)
        }
    }
}

impl Element for f32 {
    const TYPE: StorageType = StorageType::Float;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        f32::from_le_bytes(raw)
    }

    fn to_value(self) -> Value {
        if self.is_nan() {
            Value::Missing
        } else {
            Value::Float(self)
        }
    }
}

impl Element for i64 {
    const TYPE: StorageType = StorageType::Long;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        i64::from_le_bytes(raw)
    }

    fn to_value(self) -> Value {
        if self == i64::MIN {
            Value::Missing
        } else {
            Value::Long(self)
        }
    }
}

impl Element for i32 {
    const TYPE: StorageType = StorageType::Integer;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        i32::from_le_bytes(raw)
    }

    fn to_value(self) -> Value {
        if self == i32::MIN {
            Value::Missing
        } else {
            Value::Int(self)
        }
    }
}

impl Element for bool {
    const TYPE: StorageType = StorageType::Boolean;

    fn encode(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] == 1
    }

    fn to_value(self) -> Value {
        Value::Boolean(self)
    }
}

/// Everything needed to construct a buffer
pub(crate) struct BufferLayout {
    pub id: u64,
    pub urn: String,
    pub storage_type: StorageType,
    pub offset: u64,
    pub size: u64,
    pub mapping: CurveMapping,
    pub time_start: u64,
    pub persistence: Persistence,
    pub record_histogram: bool,
    pub histogram_bins: usize,
    pub keys: Option<Arc<KeyTable>>,
}

/// Typed, mapped array for one split of one time slice
pub struct Buffer {
    id: u64,
    urn: String,
    storage_type: StorageType,
    offset: u64,
    size: u64,
    mapping: CurveMapping,
    time_start: u64,
    persistence: Persistence,
    record_histogram: bool,
    keys: Option<Arc<KeyTable>>,
    region: Mutex<Region>,
    histogram: Mutex<StreamingHistogram>,
    written: AtomicU64,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("urn", &self.urn)
            .field("type", &self.storage_type)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("curve", &self.mapping.curve())
            .field("time_start", &self.time_start)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(layout: BufferLayout, region: Region) -> Self {
        Self {
            id: layout.id,
            urn: layout.urn,
            storage_type: layout.storage_type,
            offset: layout.offset,
            size: layout.size,
            mapping: layout.mapping,
            time_start: layout.time_start,
            persistence: layout.persistence,
            record_histogram: layout.record_histogram,
            keys: layout.keys,
            region: Mutex::new(region),
            histogram: Mutex::new(StreamingHistogram::new(layout.histogram_bins)),
            written: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// `<observation urn>#<buffer id>`
    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// First slice position covered by this buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of elements
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn fill_curve(&self) -> SpaceFillingCurve {
        self.mapping.curve()
    }

    /// Geometry of the time slice this buffer belongs to
    pub fn geometry(&self) -> &Geometry {
        self.mapping.geometry()
    }

    pub fn time_start(&self) -> u64 {
        self.time_start
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Number of values written through fillers
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Mark immutable and flush the mapped region
    pub fn finalize(&self) -> StorageResult<()> {
        self.finalized.store(true, Ordering::Release);
        self.region.lock().flush()
    }

    /// Snapshot of this buffer's histogram
    pub fn histogram(&self) -> StreamingHistogram {
        self.histogram.lock().clone()
    }

    /// Relative coordinates of local element `index`
    pub fn coordinates(&self, index: u64) -> StorageResult<Vec<u64>> {
        self.check_index(index)?;
        Ok(self.mapping.inverse(self.offset + index)?)
    }

    fn check_index(&self, index: u64) -> StorageResult<()> {
        if index >= self.size {
            return Err(StorageError::InvalidOffset {
                offset: index,
                size: self.size,
            });
        }
        Ok(())
    }

    fn check_type(&self, requested: StorageType) -> StorageResult<()> {
        if requested != self.storage_type {
            return Err(StorageError::IllegalFillerType {
                storage: self.storage_type,
                requested,
            });
        }
        Ok(())
    }

    /// Sequential typed filler over this buffer in the storage's curve order
    pub fn filler<T: Element>(&self) -> StorageResult<Filler<'_, T>> {
        self.check_type(T::TYPE)?;
        Ok(Filler {
            sink: Sink::new(self, self.cursor()?),
            _element: PhantomData,
        })
    }

    /// Typed filler visiting cells in `desired` order. Only a buffer that
    /// covers its whole slice can be remapped.
    pub fn remapped_filler<T: Element>(&self, desired: SpaceFillingCurve) -> StorageResult<Filler<'_, T>> {
        self.check_type(T::TYPE)?;
        Ok(Filler {
            sink: Sink::new(self, self.remapped_cursor(desired)?),
            _element: PhantomData,
        })
    }

    /// Filler for keyed storages; keys are interned in the storage key table
    pub fn keyed_filler(&self) -> StorageResult<KeyedFiller<'_>> {
        self.check_type(StorageType::Keyed)?;
        Ok(KeyedFiller {
            sink: Sink::new(self, self.cursor()?),
        })
    }

    /// Untyped filler converting each [`Value`] to the storage type
    pub fn value_filler(&self) -> StorageResult<ValueFiller<'_>> {
        Ok(ValueFiller {
            sink: Sink::new(self, self.cursor()?),
        })
    }

    fn cursor(&self) -> StorageResult<Cursor> {
        Ok(Cursor::range(self.mapping.clone(), self.offset, self.size)?)
    }

    fn remapped_cursor(&self, desired: SpaceFillingCurve) -> StorageResult<Cursor> {
        if desired == self.mapping.curve() {
            return self.cursor();
        }
        if self.offset != 0 || self.size != self.mapping.size() {
            return Err(StorageError::UnsupportedPartialAccess(format!(
                "buffer {} covers a split; cannot remap {} to {}",
                self.urn,
                self.mapping.curve(),
                desired
            )));
        }
        Ok(Cursor::remapping(
            self.mapping.geometry(),
            desired,
            self.mapping.curve(),
        )?)
    }

    /// Read local element `index`
    pub fn get(&self, index: u64) -> StorageResult<Value> {
        self.check_index(index)?;
        let width = self.storage_type.width();
        let start = index as usize * width;
        let region = self.region.lock();
        let bytes = &region.bytes()[start..start + width];
        Ok(match self.storage_type {
            StorageType::Double => f64::decode(bytes).to_value(),
            StorageType::Float => f32::decode(bytes).to_value(),
            StorageType::Long => i64::decode(bytes).to_value(),
            StorageType::Integer => i32::decode(bytes).to_value(),
            StorageType::Boolean => match bytes[0] {
                MISSING_BOOLEAN => Value::Missing,
                b => Value::Boolean(b == 1),
            },
            StorageType::Keyed => {
                let code = i32::decode(bytes);
                match self.keys.as_ref().and_then(|k| k.key(code)) {
                    Some(key) => Value::Key(key),
                    None => Value::Missing,
                }
            }
        })
    }

    /// Numeric view of local element `index` (NaN when missing or non-numeric)
    pub fn get_f64(&self, index: u64) -> StorageResult<f64> {
        Ok(self.get(index)?.as_f64().unwrap_or(f64::NAN))
    }

    /// Overwrite local element `index`. Does not touch the histogram.
    pub fn set(&self, index: u64, value: &Value) -> StorageResult<()> {
        self.check_index(index)?;
        self.write_value(index, value)
    }

    /// Overwrite local element `index` and count the value in the histogram
    ///
    /// Works on finalized buffers. A pass that replaces every value starts
    /// with [`clear_histogram`](Self::clear_histogram).
    pub fn update(&self, index: u64, value: &Value) -> StorageResult<()> {
        self.check_index(index)?;
        self.write_value(index, value)?;
        self.record(value);
        Ok(())
    }

    /// Drop all histogram samples, keeping the bin budget
    pub fn clear_histogram(&self) {
        let mut histogram = self.histogram.lock();
        *histogram = StreamingHistogram::new(histogram.max_bins());
    }

    fn write_element<T: Element>(&self, index: u64, value: T) {
        let width = self.storage_type.width();
        let start = index as usize * width;
        let mut region = self.region.lock();
        value.encode(&mut region.bytes_mut()[start..start + width]);
    }

    fn write_value(&self, index: u64, value: &Value) -> StorageResult<()> {
        let encoded = self.encode(value)?;
        self.store(index, encoded);
        Ok(())
    }

    /// Convert a value to the storage's element without touching memory
    fn encode(&self, value: &Value) -> StorageResult<Encoded> {
        let mismatch = || StorageError::ValueMismatch {
            storage: self.storage_type,
            value: value.to_string(),
        };
        let encoded = match self.storage_type {
            StorageType::Double => Encoded::Double(if value.is_missing() {
                f64::NAN
            } else {
                value.as_f64().ok_or_else(mismatch)?
            }),
            StorageType::Float => Encoded::Float(if value.is_missing() {
                f32::NAN
            } else {
                value.as_f64().ok_or_else(mismatch)? as f32
            }),
            StorageType::Long => Encoded::Long(match integral(value) {
                Integral::Missing => i64::MIN,
                Integral::Value(v) => v,
                Integral::NotIntegral => return Err(mismatch()),
            }),
            StorageType::Integer => Encoded::Integer(match integral(value) {
                Integral::Missing => i32::MIN,
                Integral::Value(v) => i32::try_from(v).map_err(|_| mismatch())?,
                Integral::NotIntegral => return Err(mismatch()),
            }),
            StorageType::Boolean => Encoded::Boolean(if value.is_missing() {
                MISSING_BOOLEAN
            } else {
                u8::from(value.as_bool().ok_or_else(mismatch)?)
            }),
            StorageType::Keyed => Encoded::Integer(match value {
                Value::Missing => MISSING_KEY,
                Value::Key(key) => match &self.keys {
                    Some(keys) => keys.intern(key),
                    None => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            }),
        };
        Ok(encoded)
    }

    fn store(&self, index: u64, encoded: Encoded) {
        match encoded {
            Encoded::Double(v) => self.write_element(index, v),
            Encoded::Float(v) => self.write_element(index, v),
            Encoded::Long(v) => self.write_element(index, v),
            Encoded::Integer(v) => self.write_element(index, v),
            Encoded::Boolean(byte) => self.region.lock().bytes_mut()[index as usize] = byte,
        }
    }

    fn record(&self, value: &Value) {
        if !self.record_histogram {
            return;
        }
        let mut histogram = self.histogram.lock();
        match value {
            Value::Key(key) => histogram.insert_category(key),
            v if v.is_missing() => histogram.insert_missing(),
            v => {
                if let Some(x) = v.as_f64() {
                    histogram.insert(x);
                }
            }
        }
    }

    fn record_f64(&self, value: f64) {
        if self.record_histogram {
            self.histogram.lock().insert(value);
        }
    }

    fn mark_written(&self) {
        let written = self.written.fetch_add(1, Ordering::AcqRel) + 1;
        if written == self.size {
            self.finalized.store(true, Ordering::Release);
        }
    }
}

#[derive(Clone, Copy)]
enum Encoded {
    Double(f64),
    Float(f32),
    Long(i64),
    Integer(i32),
    Boolean(u8),
}

enum Integral {
    Missing,
    Value(i64),
    NotIntegral,
}

fn integral(value: &Value) -> Integral {
    match value {
        Value::Long(v) => Integral::Value(*v),
        Value::Int(v) => Integral::Value(i64::from(*v)),
        Value::Boolean(b) => Integral::Value(i64::from(*b)),
        v if v.is_missing() => Integral::Missing,
        v => match v.as_f64() {
            // i64::MIN is the missing sentinel and i64::MAX rounds up to 2^63
            Some(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 2f64.powi(63) => {
                Integral::Value(x as i64)
            }
            _ => Integral::NotIntegral,
        },
    }
}

/// Position source shared by all filler kinds
struct Sink<'a> {
    buffer: &'a Buffer,
    cursor: Cursor,
    base: u64,
}

impl<'a> Sink<'a> {
    fn new(buffer: &'a Buffer, cursor: Cursor) -> Self {
        // Cursors yield slice positions; remapping only happens at offset 0
        Self {
            buffer,
            cursor,
            base: buffer.offset,
        }
    }

    fn next_index(&mut self) -> StorageResult<u64> {
        if !self.cursor.has_next() || self.buffer.is_finalized() {
            return Err(StorageError::InvalidOffset {
                offset: self.buffer.written(),
                size: self.buffer.size,
            });
        }
        Ok(self.cursor.next_long()? - self.base)
    }

    fn next_coordinates(&self) -> StorageResult<Vec<u64>> {
        Ok(self.cursor.peek_coordinates()?)
    }
}

/// Sequential typed writer bound to one cursor
pub struct Filler<'a, T: Element> {
    sink: Sink<'a>,
    _element: PhantomData<T>,
}

impl<T: Element> std::fmt::Debug for Filler<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filler")
            .field("buffer", self.sink.buffer)
            .field("base", &self.sink.base)
            .finish_non_exhaustive()
    }
}

impl<T: Element> Filler<'_, T> {
    /// Write the next value and feed the histogram
    pub fn add(&mut self, value: T) -> StorageResult<()> {
        let index = self.sink.next_index()?;
        let buffer = self.sink.buffer;
        buffer.write_element(index, value);
        match value.to_value() {
            Value::Missing => buffer.record(&Value::Missing),
            v => buffer.record_f64(v.as_f64().unwrap_or(f64::NAN)),
        }
        buffer.mark_written();
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.sink.cursor.has_next()
    }

    /// Coordinates of the cell the next `add` will write
    pub fn next_coordinates(&self) -> StorageResult<Vec<u64>> {
        self.sink.next_coordinates()
    }
}

/// Sequential writer for keyed storages
pub struct KeyedFiller<'a> {
    sink: Sink<'a>,
}

impl KeyedFiller<'_> {
    pub fn add(&mut self, key: &str) -> StorageResult<()> {
        self.add_value(&Value::Key(key.to_string()))
    }

    pub fn add_missing(&mut self) -> StorageResult<()> {
        self.add_value(&Value::Missing)
    }

    fn add_value(&mut self, value: &Value) -> StorageResult<()> {
        let buffer = self.sink.buffer;
        let encoded = buffer.encode(value)?;
        let index = self.sink.next_index()?;
        buffer.store(index, encoded);
        buffer.record(value);
        buffer.mark_written();
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.sink.cursor.has_next()
    }
}

/// Sequential writer accepting any [`Value`] convertible to the storage type
pub struct ValueFiller<'a> {
    sink: Sink<'a>,
}

impl ValueFiller<'_> {
    /// Write the next value; a value the storage rejects leaves the position unconsumed
    pub fn add(&mut self, value: &Value) -> StorageResult<()> {
        let buffer = self.sink.buffer;
        let encoded = buffer.encode(value)?;
        let index = self.sink.next_index()?;
        buffer.store(index, encoded);
        buffer.record(value);
        buffer.mark_written();
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.sink.cursor.has_next()
    }

    pub fn next_coordinates(&self) -> StorageResult<Vec<u64>> {
        self.sink.next_coordinates()
    }

    pub fn buffer(&self) -> &Buffer {
        self.sink.buffer
    }
}
