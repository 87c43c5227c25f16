// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Knowledge-graph sink
//!
//! A dataflow run records what it produced as one [`Transaction`]: nodes for
//! observations, actuators and the run activity, and typed links between
//! them. The store behind [`KnowledgeGraph`] is external; only the call shape
//! matters here. [`InMemoryKnowledgeGraph`] keeps committed transactions for
//! inspection.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::actuator::ActuatorKind;
use crate::observation::ObservationKind;
use crate::DataflowResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum GraphNode {
    Context(String),
    Observation(String),
    Actuator(String),
    Activity(Uuid),
    Dataflow(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Relationship {
    HasChild,
    Affects,
    ContextualizedBy,
    HasPlan,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GraphOperation {
    AddObservation {
        urn: String,
        name: String,
        kind: ObservationKind,
    },
    AddActuator {
        name: String,
        kind: ActuatorKind,
        rank: Option<usize>,
    },
    AddActivity {
        id: Uuid,
        dataflow: Uuid,
        successful: bool,
    },
    Link {
        source: GraphNode,
        target: GraphNode,
        relationship: Relationship,
        metadata: Map<String, JsonValue>,
    },
}

/// Operations committed atomically
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    id: Uuid,
    operations: Vec<GraphOperation>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            operations: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operations(&self) -> &[GraphOperation] {
        &self.operations
    }

    pub fn add(&mut self, operation: GraphOperation) {
        self.operations.push(operation);
    }

    pub fn link(&mut self, source: GraphNode, target: GraphNode, relationship: Relationship) {
        self.link_with(source, target, relationship, Map::new());
    }

    pub fn link_with(
        &mut self,
        source: GraphNode,
        target: GraphNode,
        relationship: Relationship,
        metadata: Map<String, JsonValue>,
    ) {
        self.operations.push(GraphOperation::Link {
            source,
            target,
            relationship,
            metadata,
        });
    }

    /// Links of one relationship type, in insertion order
    pub fn links(&self, relationship: Relationship) -> Vec<(&GraphNode, &GraphNode, &Map<String, JsonValue>)> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                GraphOperation::Link {
                    source,
                    target,
                    relationship: r,
                    metadata,
                } if *r == relationship => Some((source, target, metadata)),
                _ => None,
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub trait KnowledgeGraph: Send + Sync {
    /// Apply all operations of `transaction` or none of them
    fn commit(&self, transaction: Transaction) -> DataflowResult<()>;
}

/// Keeps every committed transaction in memory
#[derive(Default)]
pub struct InMemoryKnowledgeGraph {
    transactions: Mutex<Vec<Transaction>>,
}

impl InMemoryKnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().clone()
    }

    pub fn last(&self) -> Option<Transaction> {
        self.transactions.lock().last().cloned()
    }
}

impl KnowledgeGraph for InMemoryKnowledgeGraph {
    fn commit(&self, transaction: Transaction) -> DataflowResult<()> {
        self.transactions.lock().push(transaction);
        Ok(())
    }
}
