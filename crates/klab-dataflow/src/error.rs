// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Dataflow error types

use std::sync::Arc;

use klab_computation::ComputationError;
use klab_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum DataflowError {
    /// No adapter, service or function matches a call
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// An actuator could not be turned into an executor
    #[error("Compilation failed: {0}")]
    Compilation(String),

    /// A bound step failed while running
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Broken invariant in the dataflow itself, never caused by user input
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Dependency cycle through actuator {0}")]
    CycleDetected(String),

    /// Cause captured by a scalar computation while filling buffers
    #[error("Scalar computation failed: {0}")]
    ScalarFailed(Arc<ComputationError>),

    #[error("Skipped: upstream actuator {0} failed")]
    UpstreamFailed(String),

    #[error("Contextualization cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Computation(#[from] ComputationError),
}

/// Result type for dataflow operations
pub type DataflowResult<T> = Result<T, DataflowError>;
