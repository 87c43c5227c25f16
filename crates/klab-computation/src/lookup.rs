// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Table-driven scalar transformations: lookup tables, classifications and
//! unit/value mediators

use serde::{Deserialize, Serialize};

use klab_storage::Value;

use crate::{ComputationError, ComputationResult};

/// One side of a numeric interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f64,
    pub inclusive: bool,
}

impl Bound {
    pub fn inclusive(value: f64) -> Self {
        Self { value, inclusive: true }
    }

    pub fn exclusive(value: f64) -> Self {
        Self { value, inclusive: false }
    }
}

/// Condition matched against one input value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Classifier {
    /// Numeric interval; an absent bound is open-ended
    Interval { lower: Option<Bound>, upper: Option<Bound> },
    /// Exact category (key) match
    Category(String),
    Boolean(bool),
    /// Matches missing values only
    Nil,
    /// Matches anything, including missing values
    Universal,
}

impl Classifier {
    pub fn between(lower: f64, upper: f64) -> Self {
        Classifier::Interval {
            lower: Some(Bound::inclusive(lower)),
            upper: Some(Bound::exclusive(upper)),
        }
    }

    pub fn classify(&self, value: &Value) -> bool {
        match self {
            Classifier::Universal => true,
            Classifier::Nil => value.is_missing(),
            Classifier::Category(c) => value.as_key() == Some(c.as_str()),
            Classifier::Boolean(b) => !value.is_missing() && value.as_bool() == Some(*b),
            Classifier::Interval { lower, upper } => {
                let Some(x) = value.as_f64().filter(|x| !x.is_nan()) else {
                    return false;
                };
                let above = lower.map_or(true, |b| if b.inclusive { x >= b.value } else { x > b.value });
                let below = upper.map_or(true, |b| if b.inclusive { x <= b.value } else { x < b.value });
                above && below
            }
        }
    }
}

/// Ordered list of classifiers; the first match wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    classes: Vec<(Classifier, Value)>,
    default: Value,
}

impl Classification {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
            default: Value::Missing,
        }
    }

    pub fn with_class(mut self, classifier: Classifier, value: impl Into<Value>) -> Self {
        self.classes.push((classifier, value.into()));
        self
    }

    /// Value returned when nothing matches (missing unless set)
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classify(&self, value: &Value) -> Value {
        self.classes
            .iter()
            .find(|(classifier, _)| classifier.classify(value))
            .map_or_else(|| self.default.clone(), |(_, v)| v.clone())
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact-match lookup keyed on one input value
///
/// Numeric keys match numerically (`Int(3)` finds a `Double(3.0)` row);
/// keys and booleans match by equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    rows: Vec<(Value, Value)>,
    default: Value,
}

impl LookupTable {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            default: Value::Missing,
        }
    }

    pub fn with_row(mut self, key: impl Into<Value>, value: impl Into<Value>) -> Self {
        self.rows.push((key.into(), value.into()));
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn lookup(&self, key: &Value) -> Value {
        self.rows
            .iter()
            .find(|(k, _)| keys_match(k, key))
            .map_or_else(|| self.default.clone(), |(_, v)| v.clone())
    }
}

impl Default for LookupTable {
    fn default() -> Self {
        Self::new()
    }
}

fn keys_match(row: &Value, key: &Value) -> bool {
    match (row, key) {
        (Value::Key(a), Value::Key(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Missing, k) => k.is_missing(),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Linear value conversion `out = in * scale + offset` (e.g. Celsius to Kelvin)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueMediator {
    pub scale: f64,
    pub offset: f64,
}

impl ValueMediator {
    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    pub fn scale(scale: f64) -> Self {
        Self::new(scale, 0.0)
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    /// Missing stays missing; non-numeric values are a type mismatch
    pub fn convert(&self, value: &Value) -> ComputationResult<Value> {
        if value.is_missing() {
            return Ok(Value::Missing);
        }
        let x = value.as_f64().ok_or_else(|| ComputationError::TypeMismatch {
            expected: "number".to_string(),
            found: value.to_string(),
        })?;
        Ok(Value::Double(x * self.scale + self.offset))
    }
}
