// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Compiling and running actuator trees end to end

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use klab_computation::{ComputationError, FnExpression, ValueMediator};
use klab_config::{RuntimeConfig, StorageConfig};
use klab_dataflow::{
    Actuator, ActuatorState, ActuatorTree, Argument, CompiledDataflow, ContextScope, DataflowError,
    DataflowResult, FunctionRegistry, InMemoryKnowledgeGraph, Invocation, LifecycleMessage, Observation,
    ParameterType, Relationship, Resource, ResourceAdapter, ResourceRegistry, ServiceCall, Signature,
};
use klab_geometry::{Dimension, Geometry};
use klab_storage::{StorageManager, StorageType, Value};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    manager: Arc<StorageManager>,
    scope: Arc<ContextScope>,
    functions: FunctionRegistry,
    resources: ResourceRegistry,
    graph: InMemoryKnowledgeGraph,
}

fn fixture(geometry: Geometry, parallelism: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        scratch_dir: dir.path().join("ktmp"),
        ..StorageConfig::default()
    };
    let manager = Arc::new(StorageManager::open(&config, parallelism).unwrap());
    let scope = Arc::new(ContextScope::new("local:test.ctx", geometry.shared(), manager.clone()));
    Fixture {
        _dir: dir,
        manager,
        scope,
        functions: FunctionRegistry::new(),
        resources: ResourceRegistry::new(),
        graph: InMemoryKnowledgeGraph::new(),
    }
}

fn runtime(parallelism: usize) -> RuntimeConfig {
    RuntimeConfig {
        parallelism,
        fail_fast_compile: true,
    }
}

fn compile(f: &Fixture, tree: ActuatorTree, parallelism: usize) -> DataflowResult<CompiledDataflow> {
    CompiledDataflow::compile(tree, f.scope.clone(), &f.functions, &f.resources, &runtime(parallelism))
}

fn double(name: &str) -> Actuator {
    Actuator::quality(name, StorageType::Double)
}

fn number(observation: &Observation, time_start: u64, position: u64) -> f64 {
    match observation.storage().unwrap().get(time_start, position).unwrap() {
        Value::Double(v) => v,
        other => panic!("unexpected value {}", other),
    }
}

fn ranks(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
    pairs.iter().map(|(n, r)| (n.to_string(), *r)).collect()
}

// ===== TEST 1: Independent children share a rank =====

#[test]
fn test_independent_children_run_in_one_rank() {
    let f = fixture(Geometry::linear(10).unwrap(), 1);
    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(tree.root(), double("child1").with_call(ServiceCall::constant(1.0)))
        .unwrap();
    tree.add_child(tree.root(), double("child2").with_call(ServiceCall::constant(2.0)))
        .unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    assert_eq!(dataflow.ranks(), ranks(&[("child1", 0), ("child2", 0), ("root", 1)]));

    let result = dataflow.run(&f.graph).unwrap();
    assert!(result.is_success());
    assert!(result.cause.is_none());

    // one unsplit buffer of 10 per child, none for the root
    assert_eq!(f.manager.last_buffer_id(), 2);
    for (name, expected) in [("child1", 1.0), ("child2", 2.0)] {
        let observation = dataflow.observation(name).unwrap();
        let buffers = observation.storage().unwrap().all_buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].size(), 10);
        assert!((0..10).all(|i| number(observation, 0, i) == expected));
    }
    assert!(dataflow.observation("root").unwrap().storage().unwrap().all_buffers().is_empty());
}

// ===== TEST 2: A chain gets one rank per link =====

#[test]
fn test_chain_runs_in_dependency_order() {
    let f = fixture(Geometry::linear(6).unwrap(), 2);

    let mut tree = ActuatorTree::new(double("c").with_call(ServiceCall::expression(FnExpression::new(
        "b * 2",
        &["b"],
        |env| Ok(Value::Double(env.number("b")? * 2.0)),
    ))))
    .unwrap();
    let b = tree
        .add_child(
            tree.root(),
            double("b").with_call(ServiceCall::expression(FnExpression::new("a + 1", &["a"], |env| {
                Ok(Value::Double(env.number("a")? + 1.0))
            }))),
        )
        .unwrap();
    tree.add_child(b, double("a").with_call(ServiceCall::constant(1.0))).unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    assert_eq!(dataflow.ranks(), ranks(&[("a", 0), ("b", 1), ("c", 2)]));

    let result = dataflow.run(&f.graph).unwrap();
    assert!(result.is_success());
    let c = dataflow.observation("c").unwrap();
    assert!((0..6).all(|i| number(c, 0, i) == 4.0));
    assert!(c.storage().unwrap().is_finalized());
}

// ===== TEST 3: A failing step fails its actuator and its dependents only =====

#[test]
fn test_failure_is_isolated_and_reported() {
    let f = fixture(Geometry::linear(4).unwrap(), 1);

    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(
        tree.root(),
        double("bad").with_call(ServiceCall::expression(FnExpression::new("boom", &[], |_| {
            Err(ComputationError::Evaluation("boom".to_string()))
        }))),
    )
    .unwrap();
    tree.add_child(tree.root(), double("good").with_call(ServiceCall::constant(3.0)))
        .unwrap();
    let dependent = tree
        .add_child(
            tree.root(),
            double("dependent").with_call(ServiceCall::expression(FnExpression::new("bad", &["bad"], |env| {
                Ok(env.get("bad")?.clone())
            }))),
        )
        .unwrap();
    tree.add_child(dependent, Actuator::reference("bad")).unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    assert_eq!(
        dataflow.ranks(),
        ranks(&[("bad", 0), ("good", 0), ("dependent", 1), ("root", 2)])
    );

    let result = dataflow.run(&f.graph).unwrap();
    assert!(!result.is_success());
    assert_eq!(result.state("bad"), Some(ActuatorState::Failed));
    assert_eq!(result.state("good"), Some(ActuatorState::Succeeded));
    assert_eq!(result.state("dependent"), Some(ActuatorState::Failed));
    assert_eq!(result.state("root"), Some(ActuatorState::Failed));

    match result.cause.as_deref() {
        Some(DataflowError::ScalarFailed(cause)) => {
            assert!(matches!(cause.as_ref(), ComputationError::Evaluation(m) if m == "boom"))
        }
        other => panic!("unexpected cause {:?}", other),
    }
    assert_eq!(result.aborted.as_ref().map(|o| o.name()), Some("bad"));
    assert!((0..4).all(|i| number(dataflow.observation("good").unwrap(), 0, i) == 3.0));

    let messages = f.scope.drain_messages();
    assert!(messages.iter().any(|m| matches!(
        m,
        LifecycleMessage::ContextualizationAborted { actuator, .. } if actuator == "bad"
    )));
    assert!(messages.iter().any(|m| matches!(
        m,
        LifecycleMessage::ContextualizationSuccessful { actuator, .. } if actuator == "good"
    )));
    // skipped actuators never start
    assert!(!messages.iter().any(|m| m.actuator() == "dependent"));
}

// ===== TEST 4: Provenance is committed in one transaction =====

#[test]
fn test_provenance_transaction() {
    let f = fixture(Geometry::linear(3).unwrap(), 1);
    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(tree.root(), double("child1").with_call(ServiceCall::constant(1.0)))
        .unwrap();
    tree.add_child(tree.root(), double("child2").with_call(ServiceCall::constant(2.0)))
        .unwrap();

    let dataflow = compile(&f, tree, 1).unwrap();
    let result = dataflow.run(&f.graph).unwrap();

    let transactions = f.graph.transactions();
    assert_eq!(transactions.len(), 1);
    let tx = &transactions[0];
    assert_eq!(tx.id(), result.transaction);

    assert_eq!(tx.links(Relationship::HasPlan).len(), 1);
    assert_eq!(tx.links(Relationship::Resolved).len(), 1);

    let contextualized = tx.links(Relationship::ContextualizedBy);
    assert_eq!(contextualized.len(), 2);
    assert!(contextualized.iter().all(|(_, _, m)| m.contains_key("geometry")));

    let affects = tx.links(Relationship::Affects);
    assert_eq!(affects.len(), 2);
    assert!(affects
        .iter()
        .all(|(_, _, m)| m.get("rank") == Some(&serde_json::Value::from(0))));

    // qualities hang off the context; actuators link parent to child
    let has_child = tx.links(Relationship::HasChild);
    let context_children = has_child
        .iter()
        .filter(|(s, _, _)| matches!(s, klab_dataflow::GraphNode::Context(_)))
        .count();
    assert_eq!(context_children, 3);
    let actuator_children = has_child
        .iter()
        .filter(|(s, t, _)| {
            matches!(s, klab_dataflow::GraphNode::Actuator(n) if n == "root")
                && matches!(t, klab_dataflow::GraphNode::Actuator(_))
        })
        .count();
    assert_eq!(actuator_children, 2);
}

// ===== TEST 5: Resources and extension functions =====

struct Constant(f64);

impl ResourceAdapter for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    fn can_handle(&self, resource: &Resource) -> bool {
        resource.urn.starts_with("local:constant:")
    }

    fn contextualize(&self, resource: &Resource, observation: &Arc<Observation>, _: &ContextScope) -> DataflowResult<bool> {
        let geometry = resource.geometry.clone().unwrap_or_else(|| observation.geometry().clone());
        let storage = observation
            .storage()
            .ok_or_else(|| DataflowError::Execution("no storage".to_string()))?;
        for buffer in storage.buffers(&geometry)? {
            let mut filler = buffer.filler::<f64>()?;
            while filler.has_next() {
                filler.add(self.0)?;
            }
        }
        Ok(true)
    }
}

fn doubled(invocation: &Invocation<'_>) -> DataflowResult<()> {
    let source = invocation
        .observation_argument(0)
        .and_then(|o| o.storage().cloned())
        .ok_or_else(|| DataflowError::Execution("missing source".to_string()))?;
    let target = invocation
        .observation
        .and_then(|o| o.storage().cloned())
        .ok_or_else(|| DataflowError::Execution("missing target".to_string()))?;
    for buffer in target.buffers(invocation.geometry)? {
        let mut filler = buffer.filler::<f64>()?;
        let mut i = buffer.offset();
        while filler.has_next() {
            let v = source.get(0, i)?.as_f64().unwrap_or(f64::NAN);
            filler.add(v * 2.0)?;
            i += 1;
        }
    }
    Ok(())
}

#[test]
fn test_resource_and_extension_calls() {
    let f = fixture(Geometry::linear(5).unwrap(), 1);
    f.resources.add_adapter(Arc::new(Constant(21.0)));
    f.functions.register(
        Signature::new("doubled", &[ParameterType::Observation]),
        doubled,
    );

    let mut tree = ActuatorTree::new(
        double("answer").with_call(ServiceCall::extension("doubled", vec![Argument::Observation("dem".into())])),
    )
    .unwrap();
    tree.add_child(tree.root(), double("dem").with_call(ServiceCall::resource("local:constant:dem")))
        .unwrap();

    let dataflow = compile(&f, tree, 1).unwrap();
    let result = dataflow.run(&f.graph).unwrap();
    assert!(result.is_success(), "{:?}", result.cause);
    assert!((0..5).all(|i| number(dataflow.observation("answer").unwrap(), 0, i) == 42.0));
}

#[test]
fn test_unresolvable_calls_fail_compilation() {
    let f = fixture(Geometry::linear(2).unwrap(), 1);
    let mut tree = ActuatorTree::new(double("root").with_call(ServiceCall::extension("missing", vec![]))).unwrap();
    tree.add_child(tree.root(), double("data").with_call(ServiceCall::resource("remote:data:x")))
        .unwrap();

    assert!(matches!(
        compile(&f, tree.clone(), 1),
        Err(DataflowError::Resolution(_))
    ));

    let lenient = RuntimeConfig {
        parallelism: 1,
        fail_fast_compile: false,
    };
    match CompiledDataflow::compile(tree, f.scope.clone(), &f.functions, &f.resources, &lenient) {
        Err(DataflowError::Compilation(message)) => {
            assert!(message.contains("root"));
            assert!(message.contains("data"));
        }
        other => panic!("unexpected outcome {:?}", other.map(|d| d.id())),
    }
}

// ===== TEST 6: Cancellation, void actuators and time =====

#[test]
fn test_cancelled_before_run() {
    let f = fixture(Geometry::linear(3).unwrap(), 1);
    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(tree.root(), double("child").with_call(ServiceCall::constant(1.0)))
        .unwrap();
    let dataflow = compile(&f, tree, 1).unwrap();

    f.scope.cancel();
    let result = dataflow.run(&f.graph).unwrap();
    assert!(!result.is_success());
    assert!(result.states.values().all(|s| *s == ActuatorState::Failed));
    assert!(matches!(result.cause.as_deref(), Some(DataflowError::Cancelled)));
    assert!(f.scope.drain_messages().is_empty());
    // provenance is still recorded
    assert_eq!(f.graph.transactions().len(), 1);
}

#[test]
fn test_void_actuator_runs_without_observation() {
    let f = fixture(Geometry::linear(2).unwrap(), 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.functions.register(
        Signature::new("audit", &[]),
        move |invocation: &Invocation<'_>| -> DataflowResult<()> {
            assert!(invocation.observation.is_none());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );

    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(tree.root(), Actuator::void("audit").with_call(ServiceCall::extension("audit", vec![])))
        .unwrap();
    tree.add_child(tree.root(), Actuator::void("noop")).unwrap();

    let dataflow = compile(&f, tree, 1).unwrap();
    assert!(dataflow.observation("audit").is_none());
    assert_eq!(dataflow.schedule().len(), 2);

    let result = dataflow.run(&f.graph).unwrap();
    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(result.state("noop").is_none());
}

#[test]
fn test_timed_context_fills_every_step() {
    let geometry = Geometry::new(vec![Dimension::time(3), Dimension::space("x", 4)]).unwrap();
    let f = fixture(geometry, 2);
    let tree = ActuatorTree::new(double("series").with_call(ServiceCall::expression(FnExpression::new(
        "t * 10 + x",
        &[],
        |env| Ok(Value::Double(env.time_start() as f64 * 10.0 + env.coordinates()[1] as f64)),
    ))))
    .unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    assert!(dataflow.run(&f.graph).unwrap().is_success());

    let series = dataflow.observation("series").unwrap();
    assert_eq!(series.storage().unwrap().time_starts(), vec![0, 1, 2]);
    assert_eq!(number(series, 2, 3), 23.0);
    assert_eq!(number(series, 0, 1), 1.0);
}

#[test]
fn test_dataflow_runs_once() {
    let f = fixture(Geometry::linear(2).unwrap(), 1);
    let tree = ActuatorTree::new(double("root").with_call(ServiceCall::constant(1.0))).unwrap();
    let dataflow = compile(&f, tree, 1).unwrap();
    assert!(dataflow.run(&f.graph).is_ok());
    assert!(matches!(dataflow.run(&f.graph), Err(DataflowError::Internal(_))));
}

// ===== TEST 7: Scalar steps after data calls, panics, failed compiles =====

#[test]
fn test_mediation_after_resource_rewrites_values() {
    let f = fixture(Geometry::linear(4).unwrap(), 2);
    f.resources.add_adapter(Arc::new(Constant(21.0)));

    let tree = ActuatorTree::new(
        double("dem")
            .with_call(ServiceCall::resource("local:constant:dem"))
            .with_call(ServiceCall::mediate(ValueMediator::scale(2.0))),
    )
    .unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    let result = dataflow.run(&f.graph).unwrap();
    assert!(result.is_success(), "{:?}", result.cause);

    let dem = dataflow.observation("dem").unwrap();
    assert!((0..4).all(|i| number(dem, 0, i) == 42.0));
    let histogram = dem.storage().unwrap().histogram();
    assert_eq!(histogram.count(), 4);
    assert_eq!(histogram.mean(), Some(42.0));
}

#[test]
fn test_panicking_extension_aborts_only_its_actuator() {
    let f = fixture(Geometry::linear(3).unwrap(), 2);
    f.functions.register(
        Signature::new("first_reading", &[]),
        |_: &Invocation<'_>| -> DataflowResult<()> {
            let readings: Vec<f64> = Vec::new();
            if readings[0] > 0.0 {
                return Err(DataflowError::Execution("unreachable".to_string()));
            }
            Ok(())
        },
    );

    let mut tree = ActuatorTree::new(double("root")).unwrap();
    tree.add_child(
        tree.root(),
        Actuator::void("bad").with_call(ServiceCall::extension("first_reading", vec![])),
    )
    .unwrap();
    tree.add_child(tree.root(), double("good").with_call(ServiceCall::constant(5.0)))
        .unwrap();

    let dataflow = compile(&f, tree, 2).unwrap();
    let result = dataflow.run(&f.graph).unwrap();
    assert_eq!(result.state("bad"), Some(ActuatorState::Failed));
    assert_eq!(result.state("good"), Some(ActuatorState::Succeeded));
    assert!(matches!(
        result.cause.as_deref(),
        Some(DataflowError::Execution(message)) if message.contains("panicked")
    ));
    assert!((0..3).all(|i| number(dataflow.observation("good").unwrap(), 0, i) == 5.0));
    assert_eq!(f.graph.transactions().len(), 1);

    let messages = f.scope.drain_messages();
    assert!(messages.iter().any(|m| matches!(
        m,
        LifecycleMessage::ContextualizationAborted { actuator, .. } if actuator == "bad"
    )));
}

#[test]
fn test_failed_compile_leaves_no_observations() {
    let f = fixture(Geometry::linear(2).unwrap(), 1);
    let mut tree = ActuatorTree::new(double("root").with_call(ServiceCall::extension("missing", vec![]))).unwrap();
    tree.add_child(tree.root(), double("base").with_call(ServiceCall::constant(1.0)))
        .unwrap();

    assert!(compile(&f, tree.clone(), 1).is_err());
    assert_eq!(f.scope.observation_count(), 0);
    assert_eq!(f.manager.storage_count(), 0);
    assert!(f.scope.observation_named("base").is_none());

    f.functions.register(Signature::new("missing", &[]), |_: &Invocation<'_>| -> DataflowResult<()> { Ok(()) });
    let dataflow = compile(&f, tree, 1).unwrap();
    assert_eq!(f.scope.observation_count(), 2);
    assert!(dataflow.run(&f.graph).unwrap().is_success());
}
