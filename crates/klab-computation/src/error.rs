// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Computation error types

use klab_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ComputationError {
    /// An expression or step failed while evaluating one element
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Step rejected at build time (empty builder, bad table, ...)
    #[error("Invalid computation step: {0}")]
    InvalidStep(String),

    #[error("Computation cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for computation operations
pub type ComputationResult<T> = Result<T, ComputationError>;
