// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-dataflow
//!
//! Executes resolved actuator trees.
//!
//! - [`Scheduler`] turns an [`ActuatorTree`] into a dependency graph, a
//!   topological order and execution ranks
//! - [`Executor`] binds the service calls of one actuator to scalar
//!   computations, resource adapters or registered extension functions
//! - [`CompiledDataflow`] runs the ranks on a worker pool inside a
//!   [`ContextScope`] and commits provenance to a [`KnowledgeGraph`]

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod actuator;
pub mod call;
pub mod dataflow;
pub mod error;
pub mod executor;
pub mod knowledge;
pub mod observation;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod scope;

pub use actuator::{Actuator, ActuatorId, ActuatorKind, ActuatorTree};
pub use call::{Argument, ParameterType, ServiceCall};
pub use dataflow::{ActuatorState, CompiledDataflow, RunResult};
pub use error::{DataflowError, DataflowResult};
pub use executor::Executor;
pub use knowledge::{GraphNode, GraphOperation, InMemoryKnowledgeGraph, KnowledgeGraph, Relationship, Transaction};
pub use observation::{Observation, ObservationKind, UNASSIGNED_ID};
pub use registry::{ExtensionFunction, FunctionRegistry, Invocation, Signature};
pub use resources::{BoundResource, Resource, ResourceAdapter, ResourceHandler, ResourceRegistry, ResourcesService};
pub use scheduler::{DependencyEdge, Schedule, ScheduledActuator, Scheduler};
pub use scope::{ContextScope, LifecycleMessage};
