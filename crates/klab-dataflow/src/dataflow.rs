// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Compiled dataflows
//!
//! Compilation schedules the actuator tree, creates or looks up the
//! observation of every actuator and builds one [`Executor`] per scheduled
//! actuator. Running goes rank by rank on a dedicated rayon pool: actuators of
//! one rank run concurrently and the next rank starts only when all of them
//! are done. A failed actuator does not stop its rank siblings; whatever
//! depends on it is marked failed without running. The run ends with one
//! knowledge-graph transaction describing what was produced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use klab_config::RuntimeConfig;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actuator::{ActuatorId, ActuatorTree};
use crate::executor::Executor;
use crate::knowledge::{GraphNode, GraphOperation, KnowledgeGraph, Relationship, Transaction};
use crate::observation::{Observation, UNASSIGNED_ID};
use crate::registry::FunctionRegistry;
use crate::resources::ResourceRegistry;
use crate::scheduler::{Schedule, Scheduler};
use crate::scope::ContextScope;
use crate::{DataflowError, DataflowResult};

/// Execution state of one actuator; `Succeeded` and `Failed` are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActuatorState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of [`CompiledDataflow::run`]
#[derive(Debug, Clone)]
pub struct RunResult {
    pub dataflow: Uuid,
    /// Final state per scheduled actuator, by name
    pub states: BTreeMap<String, ActuatorState>,
    /// First failure in schedule order
    pub cause: Option<Arc<DataflowError>>,
    /// Observation of the actuator that produced `cause`
    pub aborted: Option<Arc<Observation>>,
    pub elapsed: Duration,
    /// Id of the committed knowledge-graph transaction
    pub transaction: Uuid,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.states.values().all(|s| *s == ActuatorState::Succeeded)
    }

    pub fn state(&self, actuator: &str) -> Option<ActuatorState> {
        self.states.get(actuator).copied()
    }
}

#[derive(Default)]
struct RunState {
    states: AHashMap<ActuatorId, ActuatorState>,
    causes: AHashMap<ActuatorId, Arc<DataflowError>>,
}

impl RunState {
    fn set(&mut self, actuator: ActuatorId, state: ActuatorState) {
        self.states.insert(actuator, state);
    }

    fn fail(&mut self, actuator: ActuatorId, cause: Arc<DataflowError>) {
        self.states.insert(actuator, ActuatorState::Failed);
        self.causes.insert(actuator, cause);
    }
}

pub struct CompiledDataflow {
    id: Uuid,
    tree: ActuatorTree,
    schedule: Schedule,
    scope: Arc<ContextScope>,
    observations: AHashMap<ActuatorId, Arc<Observation>>,
    executors: AHashMap<ActuatorId, Executor>,
    pool: rayon::ThreadPool,
    started: AtomicBool,
}

impl std::fmt::Debug for CompiledDataflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDataflow")
            .field("id", &self.id)
            .field("actuators", &self.schedule.len())
            .field("ranks", &self.schedule.rank_count())
            .finish()
    }
}

impl CompiledDataflow {
    /// Schedule `tree` and bind every actuator to an executor
    ///
    /// # Errors
    ///
    /// - `CycleDetected` from the scheduler
    /// - `Internal` if an actuator names an observation missing from the scope
    /// - the first actuator compilation error when `fail_fast_compile` is set,
    ///   otherwise a `Compilation` error listing every failing actuator
    ///
    /// Observations created here are removed from the scope again when
    /// compilation fails.
    pub fn compile(
        tree: ActuatorTree,
        scope: Arc<ContextScope>,
        functions: &FunctionRegistry,
        resources: &ResourceRegistry,
        config: &RuntimeConfig,
    ) -> DataflowResult<Self> {
        let id = Uuid::now_v7();
        let schedule = Scheduler::schedule(&tree)?;

        let mut created: Vec<i64> = Vec::new();
        let bound = Self::create_observations(&tree, &schedule, &scope, &mut created).and_then(|observations| {
            let executors = Self::bind_executors(&tree, &schedule, &observations, &scope, functions, resources, config)?;
            Ok((observations, executors))
        });
        let (observations, executors) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                for observation in created {
                    scope.remove_observation(observation);
                }
                return Err(e);
            }
        };

        let parallelism = config.effective_parallelism();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("klab-dataflow-{}", i))
            .build()
            .map_err(|e| DataflowError::Internal(format!("cannot build worker pool: {}", e)))?;

        info!(
            target: "klab-dataflow",
            "Compiled dataflow {} for {}: {} actuator(s), {} rank(s), {} worker(s)",
            id,
            scope.context_urn(),
            schedule.len(),
            schedule.rank_count(),
            parallelism
        );

        Ok(Self {
            id,
            tree,
            schedule,
            scope,
            observations,
            executors,
            pool,
            started: AtomicBool::new(false),
        })
    }

    fn create_observations(
        tree: &ActuatorTree,
        schedule: &Schedule,
        scope: &ContextScope,
        created: &mut Vec<i64>,
    ) -> DataflowResult<AHashMap<ActuatorId, Arc<Observation>>> {
        let mut observations = AHashMap::new();
        for &vertex in schedule.vertices() {
            let actuator = &tree[vertex];
            if !actuator.produces_observation() {
                continue;
            }
            let observation = if actuator.observation_id == UNASSIGNED_ID {
                let geometry = actuator
                    .geometry
                    .clone()
                    .unwrap_or_else(|| scope.geometry().clone());
                let observation = scope.create_observation(
                    &actuator.name,
                    actuator.artifact,
                    geometry,
                    actuator.storage_type,
                    &actuator.annotations,
                )?;
                created.push(observation.id());
                observation
            } else {
                scope.observation(actuator.observation_id).ok_or_else(|| {
                    DataflowError::Internal(format!(
                        "observation {} of actuator {} is not in the context",
                        actuator.observation_id, actuator.name
                    ))
                })?
            };
            observations.insert(vertex, observation);
        }
        Ok(observations)
    }

    fn bind_executors(
        tree: &ActuatorTree,
        schedule: &Schedule,
        observations: &AHashMap<ActuatorId, Arc<Observation>>,
        scope: &ContextScope,
        functions: &FunctionRegistry,
        resources: &ResourceRegistry,
        config: &RuntimeConfig,
    ) -> DataflowResult<AHashMap<ActuatorId, Executor>> {
        let mut executors = AHashMap::new();
        let mut failures: Vec<String> = Vec::new();
        for scheduled in schedule.order() {
            let actuator = &tree[scheduled.actuator];
            let observation = observations.get(&scheduled.actuator).cloned();
            match Executor::compile(actuator, observation, scope, functions, resources) {
                Ok(executor) => {
                    executors.insert(scheduled.actuator, executor);
                }
                Err(e) if config.fail_fast_compile => {
                    warn!(target: "klab-dataflow", "Actuator {} did not compile: {}", actuator.name, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(target: "klab-dataflow", "Actuator {} did not compile: {}", actuator.name, e);
                    failures.push(format!("{}: {}", actuator.name, e));
                }
            }
        }
        if !failures.is_empty() {
            return Err(DataflowError::Compilation(failures.join("; ")));
        }
        Ok(executors)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tree(&self) -> &ActuatorTree {
        &self.tree
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn scope(&self) -> &Arc<ContextScope> {
        &self.scope
    }

    /// Rank of the actuator named `name`
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.schedule.rank_of(self.tree.find(name)?)
    }

    /// Ranks of all scheduled actuators by name
    pub fn ranks(&self) -> BTreeMap<String, usize> {
        self.schedule
            .order()
            .iter()
            .map(|s| (self.tree[s.actuator].name.clone(), s.rank))
            .collect()
    }

    /// Observation produced by the actuator named `name`
    pub fn observation(&self, name: &str) -> Option<&Arc<Observation>> {
        self.observations.get(&self.tree.find(name)?)
    }

    pub fn observations(&self) -> impl Iterator<Item = &Arc<Observation>> {
        self.schedule
            .vertices()
            .iter()
            .filter_map(|v| self.observations.get(v))
    }

    /// Run all ranks, then commit the outcome to `graph`
    ///
    /// Actuator failures are reported in the result, not as an error.
    ///
    /// # Errors
    ///
    /// - `Internal` if the dataflow already ran
    /// - whatever `graph` returns from the commit
    pub fn run(&self, graph: &dyn KnowledgeGraph) -> DataflowResult<RunResult> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DataflowError::Internal(format!("dataflow {} already ran", self.id)));
        }
        let start = Instant::now();
        let state = Mutex::new(RunState::default());
        {
            let mut state = state.lock();
            for scheduled in self.schedule.order() {
                state.set(scheduled.actuator, ActuatorState::Pending);
            }
        }

        for (rank, group) in self.schedule.ranked_groups() {
            if self.scope.is_cancelled() {
                info!(target: "klab-dataflow", "Dataflow {} cancelled before rank {}", self.id, rank);
                break;
            }
            debug!(target: "klab-dataflow", "Rank {}: dispatching {} actuator(s)", rank, group.len());
            self.pool.install(|| {
                group.par_iter().for_each(|&actuator| self.run_actuator(actuator, &state));
            });
        }

        let mut state = state.into_inner();
        // anything still pending was cut off by cancellation
        let cancelled = Arc::new(DataflowError::Cancelled);
        for scheduled in self.schedule.order() {
            if state.states.get(&scheduled.actuator) == Some(&ActuatorState::Pending) {
                state.fail(scheduled.actuator, cancelled.clone());
            }
        }

        let first_failure = self
            .schedule
            .order()
            .iter()
            .find_map(|s| state.causes.get(&s.actuator).map(|c| (s.actuator, c.clone())));
        let states: BTreeMap<String, ActuatorState> = self
            .schedule
            .order()
            .iter()
            .map(|s| {
                let st = state.states.get(&s.actuator).copied().unwrap_or(ActuatorState::Pending);
                (self.tree[s.actuator].name.clone(), st)
            })
            .collect();
        let successful = first_failure.is_none();

        let transaction = self.provenance(&state, successful);
        let transaction_id = transaction.id();
        graph.commit(transaction)?;

        let result = RunResult {
            dataflow: self.id,
            states,
            aborted: first_failure
                .as_ref()
                .and_then(|(a, _)| self.observations.get(a).cloned()),
            cause: first_failure.map(|(_, c)| c),
            elapsed: start.elapsed(),
            transaction: transaction_id,
        };
        match &result.cause {
            None => info!(
                target: "klab-dataflow",
                "Dataflow {} completed in {:?}",
                self.id,
                result.elapsed
            ),
            Some(cause) => warn!(
                target: "klab-dataflow",
                "Dataflow {} failed in {:?}: {}",
                self.id,
                result.elapsed,
                cause
            ),
        }
        Ok(result)
    }

    fn run_actuator(&self, actuator: ActuatorId, state: &Mutex<RunState>) {
        let name = &self.tree[actuator].name;
        {
            let mut state = state.lock();
            if self.scope.is_cancelled() {
                state.fail(actuator, Arc::new(DataflowError::Cancelled));
                return;
            }
            if let Some(upstream) = self.failed_upstream(actuator, &state.states) {
                debug!(target: "klab-dataflow", "Skipping {}: {} failed", name, self.tree[upstream].name);
                state.fail(
                    actuator,
                    Arc::new(DataflowError::UpstreamFailed(self.tree[upstream].name.clone())),
                );
                return;
            }
            state.set(actuator, ActuatorState::Running);
        }

        let outcome = match self.executors.get(&actuator) {
            Some(executor) => executor.run(&self.scope),
            None => Err(Arc::new(DataflowError::Internal(format!(
                "no executor for actuator {}",
                name
            )))),
        };

        let mut state = state.lock();
        match outcome {
            Ok(()) => state.set(actuator, ActuatorState::Succeeded),
            Err(cause) => state.fail(actuator, cause),
        }
    }

    /// First failed actuator this one depends on, looking through vertices
    /// that are not scheduled themselves
    fn failed_upstream(
        &self,
        actuator: ActuatorId,
        states: &AHashMap<ActuatorId, ActuatorState>,
    ) -> Option<ActuatorId> {
        let mut visited: AHashSet<ActuatorId> = AHashSet::new();
        let mut stack: Vec<ActuatorId> = self.schedule.dependencies(actuator).to_vec();
        while let Some(source) = stack.pop() {
            if !visited.insert(source) {
                continue;
            }
            match states.get(&source) {
                Some(ActuatorState::Failed) => return Some(source),
                Some(_) => {}
                None => stack.extend_from_slice(self.schedule.dependencies(source)),
            }
        }
        None
    }

    /// Knowledge-graph record of this run
    fn provenance(&self, state: &RunState, successful: bool) -> Transaction {
        let mut tx = Transaction::new();
        let activity_id = Uuid::now_v7();
        let activity = GraphNode::Activity(activity_id);
        let context = GraphNode::Context(self.scope.context_urn().to_string());
        let root = self.tree.root();
        let root_observation = self.observations.get(&root);

        tx.add(GraphOperation::AddActivity {
            id: activity_id,
            dataflow: self.id,
            successful,
        });

        for &vertex in self.schedule.vertices() {
            let Some(observation) = self.observations.get(&vertex) else {
                continue;
            };
            tx.add(GraphOperation::AddObservation {
                urn: observation.urn().to_string(),
                name: observation.name().to_string(),
                kind: observation.kind(),
            });
            let node = GraphNode::Observation(observation.urn().to_string());
            match root_observation {
                Some(root_obs) if vertex != root && !observation.kind().belongs_to_context() => {
                    tx.link(
                        GraphNode::Observation(root_obs.urn().to_string()),
                        node,
                        Relationship::HasChild,
                    );
                }
                _ => tx.link(context.clone(), node, Relationship::HasChild),
            }
        }

        for &vertex in self.schedule.vertices() {
            let actuator = &self.tree[vertex];
            tx.add(GraphOperation::AddActuator {
                name: actuator.name.clone(),
                kind: actuator.kind,
                rank: self.schedule.rank_of(vertex),
            });
            if actuator.computation.is_empty() {
                continue;
            }
            if let Some(observation) = self.observations.get(&vertex) {
                let mut metadata = Map::new();
                metadata.insert(
                    "geometry".to_string(),
                    JsonValue::String(observation.geometry().to_string()),
                );
                if let Some(s) = state.states.get(&vertex) {
                    metadata.insert("state".to_string(), serde_json::to_value(s).unwrap_or(JsonValue::Null));
                }
                tx.link_with(
                    GraphNode::Observation(observation.urn().to_string()),
                    GraphNode::Actuator(actuator.name.clone()),
                    Relationship::ContextualizedBy,
                    metadata,
                );
            }
        }

        let root_actuator = GraphNode::Actuator(self.tree[root].name.clone());
        tx.link(activity.clone(), root_actuator.clone(), Relationship::HasPlan);
        tx.link(GraphNode::Dataflow(self.id), root_actuator, Relationship::HasChild);
        if let Some(root_obs) = root_observation {
            tx.link(
                activity,
                GraphNode::Observation(root_obs.urn().to_string()),
                Relationship::Resolved,
            );
        }

        for edge in self.schedule.edges() {
            if let (Some(source), Some(target)) =
                (self.observations.get(&edge.source), self.observations.get(&edge.target))
            {
                let mut metadata = Map::new();
                metadata.insert("rank".to_string(), JsonValue::from(edge.rank));
                tx.link_with(
                    GraphNode::Observation(source.urn().to_string()),
                    GraphNode::Observation(target.urn().to_string()),
                    Relationship::Affects,
                    metadata,
                );
            }
            tx.link(
                GraphNode::Actuator(self.tree[edge.target].name.clone()),
                GraphNode::Actuator(self.tree[edge.source].name.clone()),
                Relationship::HasChild,
            );
        }

        debug!(
            target: "klab-dataflow",
            "Provenance transaction {} with {} operation(s)",
            tx.id(),
            tx.operations().len()
        );
        tx
    }
}
