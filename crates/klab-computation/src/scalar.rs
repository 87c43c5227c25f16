// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Fused scalar computation
//!
//! A [`Builder`] collects the scalar steps of one actuator and fuses them into
//! a [`ScalarComputation`] that visits every element of the target buffers
//! once, running all steps per element without materializing intermediates.
//!
//! When every step is reentrant the computation may run the splits of a time
//! slice concurrently on the current rayon pool; each split gets its own
//! environment and writes its own histogram. Otherwise splits are filled one
//! after the other in offset order.
//!
//! A computation built with [`Builder::rewrite`] does not fill: it starts
//! each element from the value already stored and overwrites it in place.
//! Steps that panic are reported as evaluation failures.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use klab_geometry::Geometry;
use klab_storage::{Buffer, Storage, Value};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::expression::{Environment, SELF};
use crate::{ComputationError, ComputationResult, ComputationStep};

/// Elements filled between two cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Accumulates scalar steps for one target observation
pub struct Builder {
    target: String,
    steps: Vec<ComputationStep>,
    inputs: Vec<(String, Arc<Storage>)>,
    cancel: Option<Arc<AtomicBool>>,
    rewrite: bool,
}

impl Builder {
    /// `target` names the observation being computed (diagnostics only)
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            steps: Vec::new(),
            inputs: Vec::new(),
            cancel: None,
            rewrite: false,
        }
    }

    /// Append a step
    ///
    /// # Errors
    ///
    /// `InvalidStep` for classifications without classes
    pub fn add(&mut self, step: ComputationStep) -> ComputationResult<()> {
        if let ComputationStep::Classify { classification, .. } = &step {
            if classification.is_empty() {
                return Err(ComputationError::InvalidStep(format!(
                    "classification of {} has no classes",
                    self.target
                )));
            }
        }
        trace!(target: "klab-computation", "{}: add step {:?}", self.target, step);
        self.steps.push(step);
        Ok(())
    }

    /// Make the values of `storage` visible to steps as `name`
    pub fn input(&mut self, name: impl Into<String>, storage: Arc<Storage>) -> &mut Self {
        self.inputs.push((name.into(), storage));
        self
    }

    /// Abort filling when `flag` becomes true
    pub fn cancel_on(&mut self, flag: Arc<AtomicBool>) -> &mut Self {
        self.cancel = Some(flag);
        self
    }

    /// Seed `self` from the values already in the target buffers and write
    /// results back in place
    pub fn rewrite(&mut self) -> &mut Self {
        self.rewrite = true;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fuse the collected steps
    ///
    /// # Errors
    ///
    /// - `InvalidStep` if no step was added
    /// - `UnknownVariable` if a step reads a variable that is neither an input,
    ///   `self`, nor written by an earlier step
    pub fn build(self) -> ComputationResult<ScalarComputation> {
        if self.steps.is_empty() {
            return Err(ComputationError::InvalidStep(format!(
                "no scalar steps for {}",
                self.target
            )));
        }

        let mut known: AHashSet<String> = self.inputs.iter().map(|(n, _)| n.clone()).collect();
        known.insert(SELF.to_string());
        for step in &self.steps {
            if let Some(missing) = step.inputs().into_iter().find(|v| !known.contains(v)) {
                return Err(ComputationError::UnknownVariable(missing));
            }
            known.insert(step.target().to_string());
        }

        let parallelizable = self.steps.iter().all(ComputationStep::is_reentrant);
        debug!(
            target: "klab-computation",
            "Fused {} scalar step(s) for {} ({} input(s), parallelizable: {}, rewrite: {})",
            self.steps.len(),
            self.target,
            self.inputs.len(),
            parallelizable,
            self.rewrite
        );

        Ok(ScalarComputation {
            target: self.target,
            steps: self.steps,
            inputs: self.inputs,
            parallelizable,
            rewrite: self.rewrite,
            cancel: self.cancel,
            cause: Mutex::new(None),
        })
    }
}

/// Input storage resolved against one target buffer
struct BoundInput<'a> {
    name: &'a str,
    storage: &'a Storage,
    time_start: u64,
    /// For each input dimension, the matching target dimension
    axes: Vec<Option<usize>>,
}

impl<'a> BoundInput<'a> {
    fn bind(name: &'a str, storage: &'a Storage, target: &Geometry, time_start: u64) -> Self {
        let axes = storage
            .geometry()
            .dimensions()
            .iter()
            .map(|d| target.dimensions().iter().position(|t| t.name == d.name))
            .collect();
        let time_start = if storage.geometry().time().is_some() { time_start } else { 0 };
        Self {
            name,
            storage,
            time_start,
            axes,
        }
    }

    fn read(&self, coordinates: &[u64]) -> ComputationResult<Value> {
        let projected: Vec<u64> = self
            .axes
            .iter()
            .map(|axis| axis.map_or(0, |a| coordinates[a]))
            .collect();
        Ok(self.storage.get_at(self.time_start, &projected)?)
    }
}

/// Executable unit produced by [`Builder::build`]
pub struct ScalarComputation {
    target: String,
    steps: Vec<ComputationStep>,
    inputs: Vec<(String, Arc<Storage>)>,
    parallelizable: bool,
    rewrite: bool,
    cancel: Option<Arc<AtomicBool>>,
    cause: Mutex<Option<Arc<ComputationError>>>,
}

impl std::fmt::Debug for ScalarComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarComputation")
            .field("target", &self.target)
            .field("steps", &self.steps)
            .field("parallelizable", &self.parallelizable)
            .field("rewrite", &self.rewrite)
            .finish()
    }
}

impl ScalarComputation {
    /// True unless a step keeps state across elements
    pub fn is_parallelizable(&self) -> bool {
        self.parallelizable
    }

    /// True if elements start from the stored value instead of missing
    pub fn is_rewrite(&self) -> bool {
        self.rewrite
    }

    pub fn steps(&self) -> &[ComputationStep] {
        &self.steps
    }

    /// First failure captured by [`run`](Self::run)
    pub fn cause(&self) -> Option<Arc<ComputationError>> {
        self.cause.lock().clone()
    }

    /// Fill `buffers` (the splits of one time slice)
    ///
    /// Returns false on failure and keeps the cause; never panics across the
    /// step boundary. Parallel runs use the rayon pool the caller runs in.
    pub fn run(&self, buffers: &[Arc<Buffer>]) -> bool {
        let result = if self.parallelizable && buffers.len() > 1 {
            // every split runs to its own end; the first failure in split order wins
            let results: Vec<ComputationResult<u64>> =
                buffers.par_iter().map(|buffer| self.run_guarded(buffer)).collect();
            results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
        } else {
            let mut ordered: Vec<&Arc<Buffer>> = buffers.iter().collect();
            ordered.sort_by_key(|b| b.offset());
            ordered
                .into_iter()
                .try_for_each(|buffer| self.run_guarded(buffer).map(|_| ()))
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "klab-computation", "Scalar computation for {} failed: {}", self.target, e);
                let mut cause = self.cause.lock();
                if cause.is_none() {
                    *cause = Some(Arc::new(e));
                }
                false
            }
        }
    }

    /// Fill (or rewrite) one buffer; returns the number of elements written
    pub fn run_buffer(&self, buffer: &Buffer) -> ComputationResult<u64> {
        let time_start = buffer.time_start();
        let inputs: Vec<BoundInput<'_>> = self
            .inputs
            .iter()
            .map(|(name, storage)| BoundInput::bind(name, storage, buffer.geometry(), time_start))
            .collect();

        let written = if self.rewrite {
            self.rewrite_buffer(buffer, &inputs)?
        } else {
            self.fill_buffer(buffer, &inputs)?
        };
        trace!(target: "klab-computation", "Computed {} ({} elements)", buffer.urn(), written);
        Ok(written)
    }

    fn run_guarded(&self, buffer: &Buffer) -> ComputationResult<u64> {
        panic::catch_unwind(AssertUnwindSafe(|| self.run_buffer(buffer))).unwrap_or_else(|payload| {
            Err(ComputationError::Evaluation(format!(
                "step panicked in {}: {}",
                buffer.urn(),
                panic_message(payload.as_ref())
            )))
        })
    }

    fn fill_buffer(&self, buffer: &Buffer, inputs: &[BoundInput<'_>]) -> ComputationResult<u64> {
        let mut filler = buffer.value_filler()?;
        let mut env = Environment::new();
        let mut written = 0u64;
        while filler.has_next() {
            if written % CANCEL_CHECK_INTERVAL == 0 && self.is_cancelled() {
                return Err(ComputationError::Cancelled);
            }
            let coordinates = filler.next_coordinates()?;
            self.evaluate(&mut env, inputs, coordinates, buffer.time_start(), Value::Missing)?;
            filler.add(env.self_value())?;
            written += 1;
        }
        Ok(written)
    }

    fn rewrite_buffer(&self, buffer: &Buffer, inputs: &[BoundInput<'_>]) -> ComputationResult<u64> {
        buffer.clear_histogram();
        let mut env = Environment::new();
        for index in 0..buffer.size() {
            if index % CANCEL_CHECK_INTERVAL == 0 && self.is_cancelled() {
                return Err(ComputationError::Cancelled);
            }
            let coordinates = buffer.coordinates(index)?;
            self.evaluate(&mut env, inputs, coordinates, buffer.time_start(), buffer.get(index)?)?;
            buffer.update(index, env.self_value())?;
        }
        Ok(buffer.size())
    }

    fn evaluate(
        &self,
        env: &mut Environment,
        inputs: &[BoundInput<'_>],
        coordinates: Vec<u64>,
        time_start: u64,
        current: Value,
    ) -> ComputationResult<()> {
        for input in inputs {
            env.set(input.name, input.read(&coordinates)?);
        }
        env.locate(coordinates, time_start);
        env.set(SELF, current);
        for step in &self.steps {
            step.apply(env)?;
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}
