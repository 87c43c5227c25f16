// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-runtime
//!
//! Dataflow execution core for resolved modelling plans.
//!
//! A resolver hands over a tree of actuators; this crate family schedules it
//! into ranks of independent work, binds each actuator to scalar
//! computations, data adapters or extension functions, fills
//! geometry-indexed storage in parallel and records provenance.
//!
//! ## Crates
//!
//! - [`config`]: TOML configuration with environment and CLI overrides
//! - [`observability`]: logging setup and per-crate debug flags
//! - [`geometry`]: geometries, space-filling curves and cursors
//! - [`storage`]: memory-mapped typed storage, buffers and histograms
//! - [`computation`]: scalar computation steps and the builder
//! - [`dataflow`]: actuators, scheduler, executors and compiled dataflows
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use klab_runtime::prelude::*;
//!
//! let config = load_config(None, None)?;
//! let manager = Arc::new(StorageManager::open(&config.storage, config.runtime.effective_parallelism())?);
//! let scope = Arc::new(ContextScope::new("local:ctx", Geometry::grid(100, 100)?.shared(), manager));
//!
//! let mut tree = ActuatorTree::new(Actuator::quality("elevation", StorageType::Double))?;
//! tree.add_child(
//!     tree.root(),
//!     Actuator::quality("base", StorageType::Double).with_call(ServiceCall::constant(100.0)),
//! )?;
//!
//! let dataflow = CompiledDataflow::compile(
//!     tree,
//!     scope,
//!     &FunctionRegistry::new(),
//!     &ResourceRegistry::new(),
//!     &config.runtime,
//! )?;
//! let result = dataflow.run(&InMemoryKnowledgeGraph::new())?;
//! assert!(result.is_success());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Foundation
pub use klab_config as config;
pub use klab_observability as observability;

// Data
pub use klab_geometry as geometry;
pub use klab_storage as storage;

// Execution
pub use klab_computation as computation;
pub use klab_dataflow as dataflow;

/// Prelude - commonly used types and functions
pub mod prelude {
    pub use crate::config::{load_config, KlabConfig, LoggingConfig, RuntimeConfig, StorageConfig};
    pub use crate::observability::{init_logging, parse_debug_flags, CrateDebugFlags, LoggingGuard};

    pub use crate::geometry::{Cursor, Dimension, Geometry, SpaceFillingCurve};
    pub use crate::storage::{Buffer, Persistence, Storage, StorageManager, StorageType, Value};

    pub use crate::computation::{Builder, ComputationStep, FnExpression, ScalarComputation, ScalarExpression};

    pub use crate::dataflow::{
        Actuator, ActuatorState, ActuatorTree, Argument, CompiledDataflow, ContextScope, DataflowError,
        FunctionRegistry, InMemoryKnowledgeGraph, Invocation, KnowledgeGraph, LifecycleMessage, Observation,
        ObservationKind, ParameterType, Resource, ResourceAdapter, ResourceRegistry, RunResult, ServiceCall,
        Signature,
    };
}
