// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs through the umbrella crate: configuration file, storage
//! manager, compiled dataflow and provenance.

use std::fs;
use std::sync::Arc;

use klab_runtime::computation::{Classification, Classifier, ValueMediator};
use klab_runtime::prelude::*;
use klab_runtime::storage::ANNOTATION_SPLITS;
use tempfile::TempDir;

fn load(dir: &TempDir, parallelism: usize) -> KlabConfig {
    let path = dir.path().join("klab_configuration.toml");
    let scratch = dir.path().join("ktmp");
    fs::write(
        &path,
        format!(
            "[runtime]\nparallelism = {}\n\n[storage]\nscratch_dir = {:?}\nhistogram_bins = 10\n",
            parallelism,
            scratch.display().to_string()
        ),
    )
    .unwrap();
    load_config(Some(&path), None).unwrap()
}

fn scope(config: &KlabConfig, geometry: Geometry) -> Arc<ContextScope> {
    let manager = StorageManager::open(&config.storage, config.runtime.effective_parallelism()).unwrap();
    Arc::new(ContextScope::new("local:test.region", geometry.shared(), Arc::new(manager)))
}

// ===== TEST 1: Configured run with classification =====

#[test]
fn test_classified_elevation() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir, 2);
    assert_eq!(config.runtime.parallelism, 2);
    assert_eq!(config.storage.histogram_bins, 10);

    let scope = scope(&config, Geometry::linear(10).unwrap());
    let classes = Classification::new()
        .with_class(Classifier::between(0.0, 50.0), "low")
        .with_default("high");

    let mut tree = ActuatorTree::new(
        Actuator::quality("landcover", StorageType::Keyed).with_call(ServiceCall::classify(classes, "elevation")),
    )
    .unwrap();
    tree.add_child(
        tree.root(),
        Actuator::quality("elevation", StorageType::Double).with_call(ServiceCall::expression(FnExpression::new(
            "x * 10",
            &[],
            |env| Ok(Value::Double(env.coordinates()[0] as f64 * 10.0)),
        ))),
    )
    .unwrap();

    let dataflow = CompiledDataflow::compile(
        tree,
        scope.clone(),
        &FunctionRegistry::new(),
        &ResourceRegistry::new(),
        &config.runtime,
    )
    .unwrap();
    assert_eq!(dataflow.rank("elevation"), Some(0));
    assert_eq!(dataflow.rank("landcover"), Some(1));

    let graph = InMemoryKnowledgeGraph::new();
    let result = dataflow.run(&graph).unwrap();
    assert!(result.is_success());

    let landcover = dataflow.observation("landcover").unwrap().storage().unwrap().clone();
    assert_eq!(landcover.get(0, 0).unwrap(), Value::Key("low".to_string()));
    assert_eq!(landcover.get(0, 4).unwrap(), Value::Key("low".to_string()));
    assert_eq!(landcover.get(0, 9).unwrap(), Value::Key("high".to_string()));

    let elevation = dataflow.observation("elevation").unwrap().storage().unwrap().clone();
    let histogram = elevation.histogram();
    assert_eq!(histogram.count(), 10);
    assert_eq!(histogram.mean(), Some(45.0));
    assert!(histogram.bins().len() <= 10);

    assert!(graph.last().is_some());
}

// ===== TEST 2: Annotations drive storage layout =====

#[test]
fn test_split_annotation_and_mediation() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir, 1);
    let scope = scope(&config, Geometry::linear(9).unwrap());

    let tree = ActuatorTree::new(
        Actuator::quality("kelvin", StorageType::Double)
            .with_annotation(ANNOTATION_SPLITS, "3")
            .with_call(ServiceCall::constant(20.0))
            .with_call(ServiceCall::mediate(ValueMediator::new(1.0, 273.15))),
    )
    .unwrap();

    let dataflow = CompiledDataflow::compile(
        tree,
        scope,
        &FunctionRegistry::new(),
        &ResourceRegistry::new(),
        &config.runtime,
    )
    .unwrap();
    let result = dataflow.run(&InMemoryKnowledgeGraph::new()).unwrap();
    assert!(result.is_success());

    let storage = dataflow.observation("kelvin").unwrap().storage().unwrap().clone();
    let buffers = storage.all_buffers();
    assert_eq!(buffers.len(), 3);
    assert!(buffers.iter().all(|b| b.size() == 3));
    assert!((0..9).all(|i| storage.get(0, i).unwrap() == Value::Double(293.15)));
    assert!(storage.is_finalized());
}

// ===== TEST 3: Lifecycle messages reach a listener =====

#[test]
fn test_lifecycle_messages() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir, 2);
    let scope = scope(&config, Geometry::grid(4, 4).unwrap());
    let receiver = scope.messages();

    let mut tree = ActuatorTree::new(Actuator::quality("root", StorageType::Double)).unwrap();
    for name in ["a", "b", "c"] {
        tree.add_child(
            tree.root(),
            Actuator::quality(name, StorageType::Double).with_call(ServiceCall::constant(1.0)),
        )
        .unwrap();
    }

    let dataflow = CompiledDataflow::compile(
        tree,
        scope,
        &FunctionRegistry::new(),
        &ResourceRegistry::new(),
        &config.runtime,
    )
    .unwrap();
    assert!(dataflow.run(&InMemoryKnowledgeGraph::new()).unwrap().is_success());

    let messages: Vec<LifecycleMessage> = receiver.try_iter().collect();
    let started = messages
        .iter()
        .filter(|m| matches!(m, LifecycleMessage::ContextualizationStarted { .. }))
        .count();
    let finished = messages
        .iter()
        .filter(|m| matches!(m, LifecycleMessage::ContextualizationSuccessful { .. }))
        .count();
    assert_eq!(started, 4);
    assert_eq!(finished, 4);

    // the root is only started after every child finished
    let root_start = messages
        .iter()
        .position(|m| matches!(m, LifecycleMessage::ContextualizationStarted { actuator, .. } if actuator == "root"))
        .unwrap();
    let last_child = messages
        .iter()
        .rposition(|m| matches!(m, LifecycleMessage::ContextualizationSuccessful { actuator, .. } if actuator != "root"))
        .unwrap();
    assert!(root_start > last_child);
}
