// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Storage value types, persistence hints and per-storage options

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use klab_geometry::{Geometry, SpaceFillingCurve};
use serde::{Deserialize, Serialize};

use crate::{StorageError, StorageResult};

/// Primitive encoding of a storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Double,
    Float,
    Integer,
    Long,
    Boolean,
    /// Categorical values stored as integer codes into a key table
    Keyed,
}

impl StorageType {
    pub const ALL: [StorageType; 6] = [
        StorageType::Double,
        StorageType::Float,
        StorageType::Integer,
        StorageType::Long,
        StorageType::Boolean,
        StorageType::Keyed,
    ];

    /// Bytes per element
    pub fn width(self) -> usize {
        match self {
            StorageType::Double | StorageType::Long => 8,
            StorageType::Float | StorageType::Integer | StorageType::Keyed => 4,
            StorageType::Boolean => 1,
        }
    }

    /// Name of the memory-mapped backing file for this type
    pub fn backing_file(self) -> &'static str {
        match self {
            StorageType::Double => "dstorage.bin",
            StorageType::Float => "fstorage.bin",
            StorageType::Integer | StorageType::Keyed => "istorage.bin",
            StorageType::Long => "lstorage.bin",
            StorageType::Boolean => "bstorage.bin",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StorageType::Double => "double",
            StorageType::Float => "float",
            StorageType::Integer => "integer",
            StorageType::Long => "long",
            StorageType::Boolean => "boolean",
            StorageType::Keyed => "keyed",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, StorageType::Boolean | StorageType::Keyed)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StorageType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        StorageType::ALL
            .into_iter()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| StorageError::InvalidProperties(format!("unknown storage type '{}'", s)))
    }
}

/// How long the data behind a buffer must live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    /// Kept in the scratch file until the storage manager shuts down
    ServiceShutdown,
    /// Kept in the scratch file until the owning context is released
    ContextEnd,
    /// Anonymous memory only
    Transient,
}

impl Persistence {
    /// Whether the buffer is backed by the per-type scratch file
    pub fn is_durable(self) -> bool {
        !matches!(self, Persistence::Transient)
    }
}

/// A single observation value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Double(f64),
    Float(f32),
    Long(i64),
    Int(i32),
    Boolean(bool),
    Key(String),
    Missing,
}

impl Value {
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Missing => true,
            Value::Double(v) => v.is_nan(),
            Value::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Numeric view; booleans map to 0/1, keys and missing values to `None`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Int(v) => Some(f64::from(*v)),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Key(_) | Value::Missing => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Missing => None,
            other => other.as_f64().filter(|v| !v.is_nan()).map(|v| v != 0.0),
        }
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            Value::Key(k) => Some(k),
            _ => None,
        }
    }

    /// Storage type that naturally holds this value
    pub fn natural_type(&self) -> Option<StorageType> {
        match self {
            Value::Double(_) => Some(StorageType::Double),
            Value::Float(_) => Some(StorageType::Float),
            Value::Long(_) => Some(StorageType::Long),
            Value::Int(_) => Some(StorageType::Integer),
            Value::Boolean(_) => Some(StorageType::Boolean),
            Value::Key(_) => Some(StorageType::Keyed),
            Value::Missing => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Key(k) => write!(f, "'{}'", k),
            Value::Missing => write!(f, "missing"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Key(v.to_string())
    }
}

/// Annotation keys that override storage options
pub const ANNOTATION_FILL_CURVE: &str = "fillcurve";
pub const ANNOTATION_TYPE: &str = "type";
pub const ANNOTATION_SPLITS: &str = "splits";

/// Layout choices for one storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    pub storage_type: StorageType,
    pub fill_curve: SpaceFillingCurve,
    pub splits: usize,
    pub persistence: Persistence,
}

impl StorageOptions {
    /// Defaults for `geometry`: the geometry's natural curve, `parallelism` splits
    pub fn new(storage_type: StorageType, geometry: &Geometry, parallelism: usize) -> Self {
        Self {
            storage_type,
            fill_curve: SpaceFillingCurve::default_for(geometry),
            splits: parallelism.max(1),
            persistence: Persistence::ServiceShutdown,
        }
    }

    pub fn with_splits(mut self, splits: usize) -> Self {
        self.splits = splits.max(1);
        self
    }

    pub fn with_fill_curve(mut self, curve: SpaceFillingCurve) -> Self {
        self.fill_curve = curve;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Apply `fillcurve`, `type` and `splits` from a storage annotation
    pub fn with_annotations(mut self, annotations: &HashMap<String, String>) -> StorageResult<Self> {
        if let Some(curve) = annotations.get(ANNOTATION_FILL_CURVE) {
            self.fill_curve = curve.parse()?;
        }
        if let Some(storage_type) = annotations.get(ANNOTATION_TYPE) {
            self.storage_type = storage_type.parse()?;
        }
        if let Some(splits) = annotations.get(ANNOTATION_SPLITS) {
            let splits: usize = splits.trim().parse().map_err(|_| {
                StorageError::InvalidProperties(format!("splits must be a positive integer, got '{}'", splits))
            })?;
            self = self.with_splits(splits);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_file_names() {
        assert_eq!(StorageType::Double.backing_file(), "dstorage.bin");
        assert_eq!(StorageType::Float.backing_file(), "fstorage.bin");
        assert_eq!(StorageType::Integer.backing_file(), "istorage.bin");
        assert_eq!(StorageType::Long.backing_file(), "lstorage.bin");
        assert_eq!(StorageType::Boolean.backing_file(), "bstorage.bin");
    }

    #[test]
    fn test_annotations_override_defaults() {
        let geometry = Geometry::grid(10, 10).unwrap();
        let options = StorageOptions::new(StorageType::Double, &geometry, 4);
        assert_eq!(options.fill_curve, SpaceFillingCurve::D2Xy);
        assert_eq!(options.splits, 4);

        let mut annotations = HashMap::new();
        annotations.insert("fillcurve".to_string(), "hilbert".to_string());
        annotations.insert("type".to_string(), "Float".to_string());
        annotations.insert("splits".to_string(), "2".to_string());
        let options = options.with_annotations(&annotations).unwrap();
        assert_eq!(options.fill_curve, SpaceFillingCurve::D2Hilbert);
        assert_eq!(options.storage_type, StorageType::Float);
        assert_eq!(options.splits, 2);
    }

    #[test]
    fn test_bad_annotation_rejected() {
        let geometry = Geometry::linear(5).unwrap();
        let mut annotations = HashMap::new();
        annotations.insert("splits".to_string(), "many".to_string());
        let result = StorageOptions::new(StorageType::Long, &geometry, 1).with_annotations(&annotations);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_views() {
        assert_eq!(Value::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(Value::Int(3).as_bool(), Some(true));
        assert!(Value::Double(f64::NAN).is_missing());
        assert_eq!(Value::Key("a".into()).as_f64(), None);
        assert_eq!(Value::from("wet").as_key(), Some("wet"));
    }
}
