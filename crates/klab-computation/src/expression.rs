// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Scalar expressions and their per-element environment
//!
//! Expressions are compiled elsewhere; this crate only sees them through
//! [`ScalarExpression`]. The environment exposes the current target value as
//! `self`, the values of input observations by name, and the coordinates of
//! the element being computed.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use klab_storage::Value;
use parking_lot::Mutex;

use crate::{ComputationError, ComputationResult};

/// Name of the target variable
pub const SELF: &str = "self";

/// Variables visible to a step while one element is computed
#[derive(Debug, Default)]
pub struct Environment {
    values: AHashMap<String, Value>,
    coordinates: Vec<u64>,
    time_start: u64,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`, `UnknownVariable` if never set
    pub fn get(&self, name: &str) -> ComputationResult<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| ComputationError::UnknownVariable(name.to_string()))
    }

    /// Numeric value of `name`; missing values come back as NaN
    pub fn number(&self, name: &str) -> ComputationResult<f64> {
        let value = self.get(name)?;
        if value.is_missing() {
            return Ok(f64::NAN);
        }
        value.as_f64().ok_or_else(|| ComputationError::TypeMismatch {
            expected: "number".to_string(),
            found: value.to_string(),
        })
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match self.values.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.values.insert(name.to_string(), value);
            }
        }
    }

    pub fn self_value(&self) -> &Value {
        self.values.get(SELF).unwrap_or(&Value::Missing)
    }

    /// Coordinates of the element, relative to the time slice
    pub fn coordinates(&self) -> &[u64] {
        &self.coordinates
    }

    pub fn time_start(&self) -> u64 {
        self.time_start
    }

    pub(crate) fn locate(&mut self, coordinates: Vec<u64>, time_start: u64) {
        self.coordinates = coordinates;
        self.time_start = time_start;
    }
}

/// A compiled scalar expression
pub trait ScalarExpression: Send + Sync {
    fn evaluate(&self, env: &Environment) -> ComputationResult<Value>;

    /// Variables (other than `self`) the expression reads
    fn variables(&self) -> Vec<String> {
        Vec::new()
    }

    /// False when evaluation carries state from one element to the next
    fn is_reentrant(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "expression".to_string()
    }
}

type ExpressionBody = dyn Fn(&Environment) -> ComputationResult<Value> + Send + Sync;

/// Expression backed by a Rust closure
#[derive(Clone)]
pub struct FnExpression {
    source: String,
    variables: Vec<String>,
    body: Arc<ExpressionBody>,
}

impl FnExpression {
    /// `source` is only used for diagnostics
    pub fn new<F>(source: impl Into<String>, variables: &[&str], body: F) -> Self
    where
        F: Fn(&Environment) -> ComputationResult<Value> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            body: Arc::new(body),
        }
    }
}

impl fmt::Debug for FnExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExpression")
            .field("source", &self.source)
            .field("variables", &self.variables)
            .finish()
    }
}

impl ScalarExpression for FnExpression {
    fn evaluate(&self, env: &Environment) -> ComputationResult<Value> {
        (self.body)(env)
    }

    fn variables(&self) -> Vec<String> {
        self.variables.clone()
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}

/// Running sum of a numeric variable in visiting order
///
/// Missing inputs leave the sum unchanged and produce a missing value.
#[derive(Debug)]
pub struct Accumulator {
    variable: String,
    total: Mutex<f64>,
}

impl Accumulator {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            total: Mutex::new(0.0),
        }
    }
}

impl ScalarExpression for Accumulator {
    fn evaluate(&self, env: &Environment) -> ComputationResult<Value> {
        let x = env.number(&self.variable)?;
        if x.is_nan() {
            return Ok(Value::Missing);
        }
        let mut total = self.total.lock();
        *total += x;
        Ok(Value::Double(*total))
    }

    fn variables(&self) -> Vec<String> {
        if self.variable == SELF {
            Vec::new()
        } else {
            vec![self.variable.clone()]
        }
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("cumulative({})", self.variable)
    }
}
