// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-computation
//!
//! Scalar computation for quality observations: constants, expressions,
//! lookup tables, classifications and unit mediators are collected by a
//! [`Builder`] and fused into one [`ScalarComputation`] that fills a set of
//! storage buffers element by element.
//!
//! Expressions arrive precompiled as [`ScalarExpression`] implementations;
//! parsing an expression language is not this crate's concern.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod expression;
pub mod lookup;
pub mod scalar;
pub mod step;

pub use error::{ComputationError, ComputationResult};
pub use expression::{Accumulator, Environment, FnExpression, ScalarExpression, SELF};
pub use lookup::{Bound, Classification, Classifier, LookupTable, ValueMediator};
pub use scalar::{Builder, ScalarComputation};
pub use step::ComputationStep;
