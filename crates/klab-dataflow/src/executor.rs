// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Per-actuator executors
//!
//! Compiling an actuator binds each of its service calls to something that
//! can run: consecutive scalar calls are fused into one
//! [`ScalarComputation`], resource calls are bound to an adapter or a remote
//! service, and extension calls to a registered function.
//!
//! Scalar calls that follow a resource or extension call rewrite the values
//! those calls stored instead of filling the buffers again. A panic raised
//! while an actuator runs aborts that actuator only.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use klab_computation::{Builder, ComputationError, ScalarComputation};
use klab_geometry::Geometry;
use klab_storage::{Storage, StorageError};
use tracing::{debug, trace, warn};

use crate::actuator::Actuator;
use crate::call::{Argument, ServiceCall};
use crate::observation::Observation;
use crate::registry::{ExtensionFunction, FunctionRegistry, Invocation};
use crate::resources::{BoundResource, ResourceRegistry};
use crate::scope::{ContextScope, LifecycleMessage};
use crate::{DataflowError, DataflowResult};

enum BoundStep {
    Scalar {
        computation: ScalarComputation,
        storage: Arc<Storage>,
    },
    Resource(BoundResource),
    Extension {
        name: String,
        function: Arc<dyn ExtensionFunction>,
        arguments: Vec<Argument>,
    },
}

impl BoundStep {
    fn describe(&self) -> String {
        match self {
            BoundStep::Scalar { computation, .. } => format!("{} scalar step(s)", computation.steps().len()),
            BoundStep::Resource(bound) => format!("resource {}", bound.resource.urn),
            BoundStep::Extension { name, .. } => format!("extension {}", name),
        }
    }
}

/// Runnable form of one actuator
pub struct Executor {
    actuator: String,
    observation: Option<Arc<Observation>>,
    geometry: Arc<Geometry>,
    steps: Vec<BoundStep>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("actuator", &self.actuator)
            .field("steps", &self.steps.iter().map(BoundStep::describe).collect::<Vec<_>>())
            .finish()
    }
}

impl Executor {
    /// Bind the computation of `actuator`
    ///
    /// # Errors
    ///
    /// - `Resolution` if a resource or function cannot be resolved
    /// - `Compilation` if scalar or resource calls have no quality
    ///   observation to write into
    /// - `Computation` if the scalar steps do not form a valid computation
    pub fn compile(
        actuator: &Actuator,
        observation: Option<Arc<Observation>>,
        scope: &ContextScope,
        functions: &FunctionRegistry,
        resources: &ResourceRegistry,
    ) -> DataflowResult<Self> {
        let geometry = observation
            .as_ref()
            .map(|o| o.geometry().clone())
            .or_else(|| actuator.geometry.clone())
            .unwrap_or_else(|| scope.geometry().clone());

        let mut steps = Vec::new();
        let mut scalar: Option<(Builder, Arc<Storage>)> = None;
        for call in &actuator.computation {
            match call {
                ServiceCall::Scalar(step) => {
                    if scalar.is_none() {
                        scalar = Some(Self::scalar_builder(actuator, observation.as_ref(), scope)?);
                    }
                    if let Some((builder, _)) = scalar.as_mut() {
                        builder.add(step.clone())?;
                    }
                }
                ServiceCall::Resource { urn } => {
                    Self::flush(&mut scalar, &mut steps)?;
                    if observation.is_none() {
                        return Err(DataflowError::Compilation(format!(
                            "resource {} in {} has no observation to fill",
                            urn, actuator.name
                        )));
                    }
                    steps.push(BoundStep::Resource(resources.resolve(urn, &geometry, scope)?));
                }
                ServiceCall::Extension { name, arguments } => {
                    Self::flush(&mut scalar, &mut steps)?;
                    let function = functions.resolve(name, arguments).ok_or_else(|| {
                        DataflowError::Resolution(format!(
                            "no function matches {} with {} argument(s)",
                            name,
                            arguments.len()
                        ))
                    })?;
                    steps.push(BoundStep::Extension {
                        name: name.clone(),
                        function,
                        arguments: arguments.clone(),
                    });
                }
            }
        }
        Self::flush(&mut scalar, &mut steps)?;

        let executor = Self {
            actuator: actuator.name.clone(),
            observation,
            geometry,
            steps,
        };
        debug!(target: "klab-dataflow", "Compiled {:?}", executor);
        Ok(executor)
    }

    fn scalar_builder(
        actuator: &Actuator,
        observation: Option<&Arc<Observation>>,
        scope: &ContextScope,
    ) -> DataflowResult<(Builder, Arc<Storage>)> {
        let storage = observation
            .and_then(|o| o.storage().cloned())
            .ok_or_else(|| {
                DataflowError::Compilation(format!(
                    "scalar computation in {} needs a quality observation",
                    actuator.name
                ))
            })?;

        let mut builder = Builder::new(storage.observation_urn());
        builder.cancel_on(scope.cancel_flag());
        let mut bound: Vec<String> = Vec::new();
        for name in actuator.computation.iter().flat_map(ServiceCall::dependencies) {
            if bound.contains(&name) {
                continue;
            }
            if let Some(input) = scope.observation_named(&name).and_then(|o| o.storage().cloned()) {
                builder.input(name.clone(), input);
                bound.push(name);
            }
        }
        Ok((builder, storage))
    }

    fn flush(scalar: &mut Option<(Builder, Arc<Storage>)>, steps: &mut Vec<BoundStep>) -> DataflowResult<()> {
        if let Some((mut builder, storage)) = scalar.take() {
            // earlier resource or extension steps already wrote the target
            if !steps.is_empty() {
                builder.rewrite();
            }
            steps.push(BoundStep::Scalar {
                computation: builder.build()?,
                storage,
            });
        }
        Ok(())
    }

    pub fn actuator(&self) -> &str {
        &self.actuator
    }

    pub fn observation(&self) -> Option<&Arc<Observation>> {
        self.observation.as_ref()
    }

    /// Number of bound steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, reporting progress on the scope's channel
    ///
    /// Stops at the first failing step and returns its cause; a panic in a
    /// step becomes an `Execution` cause.
    pub fn run(&self, scope: &ContextScope) -> Result<(), Arc<DataflowError>> {
        scope.send(LifecycleMessage::ContextualizationStarted {
            actuator: self.actuator.clone(),
            observation: self.observation.clone(),
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(scope))).unwrap_or_else(|payload| {
            Err(DataflowError::Execution(format!(
                "{} panicked: {}",
                self.actuator,
                panic_message(payload.as_ref())
            )))
        });
        match outcome {
            Ok(()) => {
                scope.send(LifecycleMessage::ContextualizationSuccessful {
                    actuator: self.actuator.clone(),
                    observation: self.observation.clone(),
                });
                Ok(())
            }
            Err(e) => {
                let cause = Arc::new(e);
                warn!(target: "klab-dataflow", "Actuator {} aborted: {}", self.actuator, cause);
                scope.send(LifecycleMessage::ContextualizationAborted {
                    actuator: self.actuator.clone(),
                    observation: self.observation.clone(),
                    cause: cause.clone(),
                });
                Err(cause)
            }
        }
    }

    fn execute(&self, scope: &ContextScope) -> DataflowResult<()> {
        for step in &self.steps {
            if scope.is_cancelled() {
                return Err(DataflowError::Cancelled);
            }
            trace!(target: "klab-dataflow", "{}: running {}", self.actuator, step.describe());
            self.run_step(step, scope)?;
        }
        if let Some(storage) = self.observation.as_ref().and_then(|o| o.storage()) {
            if !self.steps.is_empty() {
                storage.finalize()?;
            }
        }
        Ok(())
    }

    fn run_step(&self, step: &BoundStep, scope: &ContextScope) -> DataflowResult<()> {
        match step {
            BoundStep::Scalar { computation, storage } => {
                for slice in time_slices(&self.geometry)? {
                    let buffers = storage.buffers(&slice)?;
                    if !computation.run(&buffers) {
                        return Err(match computation.cause() {
                            Some(cause) if matches!(*cause, ComputationError::Cancelled) => DataflowError::Cancelled,
                            Some(cause) => DataflowError::ScalarFailed(cause),
                            None => DataflowError::Internal(format!(
                                "scalar computation for {} failed without a cause",
                                self.actuator
                            )),
                        });
                    }
                }
                Ok(())
            }
            BoundStep::Resource(bound) => {
                let observation = self.observation.as_ref().ok_or_else(|| {
                    DataflowError::Internal(format!("resource step without observation in {}", self.actuator))
                })?;
                if bound.contextualize(observation, scope)? {
                    Ok(())
                } else {
                    Err(DataflowError::Execution(format!(
                        "resource {} could not be contextualized",
                        bound.resource.urn
                    )))
                }
            }
            BoundStep::Extension {
                function, arguments, ..
            } => function.call(&Invocation {
                actuator: &self.actuator,
                observation: self.observation.as_ref(),
                arguments,
                geometry: &self.geometry,
                scope,
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}

/// One geometry per time step, or the geometry itself when time does not vary
fn time_slices(geometry: &Geometry) -> DataflowResult<Vec<Geometry>> {
    match geometry.time() {
        Some(time) if time.is_varying() => (time.start..time.end())
            .map(|start| geometry.time_slice(start).map_err(StorageError::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(DataflowError::from),
        _ => Ok(vec![geometry.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klab_geometry::Dimension;

    #[test]
    fn test_time_slices() {
        let timed = Geometry::new(vec![Dimension::time(3), Dimension::space("x", 4)]).unwrap();
        let slices = time_slices(&timed).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[2].time_start(), 2);
        assert_eq!(slices[0].size(), 4);

        let space = Geometry::grid(2, 2).unwrap();
        assert_eq!(time_slices(&space).unwrap(), vec![space]);
    }
}
