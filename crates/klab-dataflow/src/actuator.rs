// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Resolved actuator trees
//!
//! Actuators live in an arena owned by [`ActuatorTree`] and refer to their
//! children by [`ActuatorId`]. A reference actuator carries only the name of
//! an actuator declared elsewhere in the tree and is resolved by the
//! scheduler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use klab_geometry::Geometry;
use klab_storage::StorageType;
use serde::{Deserialize, Serialize};

use crate::call::ServiceCall;
use crate::observation::{ObservationKind, UNASSIGNED_ID};
use crate::{DataflowError, DataflowResult};

/// Index of an actuator in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActuatorId(usize);

impl ActuatorId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorKind {
    /// Produces an observation from its computation
    Resolve,
    /// Creates the instances of a countable observable
    Instantiate,
    /// Attributes further characteristics to an existing observation
    Characterize,
    /// Points to an actuator declared elsewhere
    Reference,
    /// Runs for its side effects only, produces no observation
    Void,
}

/// One node of the resolved computation graph
#[derive(Debug, Clone)]
pub struct Actuator {
    /// Unique among the non-reference actuators of a tree; also the name of
    /// the observation it produces
    pub name: String,
    pub kind: ActuatorKind,
    pub artifact: ObservationKind,
    /// Storage type for quality artifacts; the manager default when `None`
    pub storage_type: Option<StorageType>,
    /// Id of an existing observation, [`UNASSIGNED_ID`] when one must be created
    pub observation_id: i64,
    /// Coverage; the context geometry when `None`
    pub geometry: Option<Arc<Geometry>>,
    pub computation: Vec<ServiceCall>,
    pub annotations: HashMap<String, String>,
    pub input: bool,
    pub output: bool,
    pub strategy_urn: Option<String>,
    children: Vec<ActuatorId>,
}

impl Actuator {
    pub fn new(name: impl Into<String>, kind: ActuatorKind, artifact: ObservationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            artifact,
            storage_type: None,
            observation_id: UNASSIGNED_ID,
            geometry: None,
            computation: Vec::new(),
            annotations: HashMap::new(),
            input: false,
            output: false,
            strategy_urn: None,
            children: Vec::new(),
        }
    }

    /// Resolver for a quality observation of the given storage type
    pub fn quality(name: impl Into<String>, storage_type: StorageType) -> Self {
        let mut actuator = Self::new(name, ActuatorKind::Resolve, ObservationKind::State);
        actuator.storage_type = Some(storage_type);
        actuator
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, ActuatorKind::Reference, ObservationKind::State)
    }

    pub fn void(name: impl Into<String>) -> Self {
        Self::new(name, ActuatorKind::Void, ObservationKind::Configuration)
    }

    pub fn with_call(mut self, call: ServiceCall) -> Self {
        self.computation.push(call);
        self
    }

    pub fn with_geometry(mut self, geometry: Arc<Geometry>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Bind to an observation that already exists in the context
    pub fn with_observation(mut self, id: i64) -> Self {
        self.observation_id = id;
        self
    }

    pub fn with_strategy(mut self, urn: impl Into<String>) -> Self {
        self.strategy_urn = Some(urn.into());
        self
    }

    pub fn as_input(mut self) -> Self {
        self.input = true;
        self
    }

    pub fn as_output(mut self) -> Self {
        self.output = true;
        self
    }

    pub fn is_reference(&self) -> bool {
        self.kind == ActuatorKind::Reference
    }

    /// True if running this actuator yields an observation
    pub fn produces_observation(&self) -> bool {
        !matches!(self.kind, ActuatorKind::Reference | ActuatorKind::Void)
    }

    pub fn children(&self) -> &[ActuatorId] {
        &self.children
    }
}

/// Arena holding a rooted actuator tree
#[derive(Debug, Clone)]
pub struct ActuatorTree {
    actuators: Vec<Actuator>,
    root: ActuatorId,
}

impl ActuatorTree {
    /// # Errors
    ///
    /// `Compilation` if the root is a reference
    pub fn new(root: Actuator) -> DataflowResult<Self> {
        if root.is_reference() {
            return Err(DataflowError::Compilation(format!(
                "root actuator {} cannot be a reference",
                root.name
            )));
        }
        Ok(Self {
            actuators: vec![root],
            root: ActuatorId(0),
        })
    }

    /// Append `child` under `parent`
    ///
    /// # Errors
    ///
    /// `Compilation` if `parent` is unknown or a reference, if a reference
    /// child carries computation, or if a non-reference name is already taken
    pub fn add_child(&mut self, parent: ActuatorId, child: Actuator) -> DataflowResult<ActuatorId> {
        let parent_actuator = self
            .actuators
            .get(parent.0)
            .ok_or_else(|| DataflowError::Compilation(format!("unknown parent actuator {}", parent)))?;
        if parent_actuator.is_reference() {
            return Err(DataflowError::Compilation(format!(
                "reference actuator {} cannot have children",
                parent_actuator.name
            )));
        }
        if child.is_reference() && !child.computation.is_empty() {
            return Err(DataflowError::Compilation(format!(
                "reference actuator {} cannot carry computation",
                child.name
            )));
        }
        if !child.is_reference() && self.find(&child.name).is_some() {
            return Err(DataflowError::Compilation(format!(
                "duplicate actuator name {}",
                child.name
            )));
        }

        let id = ActuatorId(self.actuators.len());
        self.actuators.push(child);
        self.actuators[parent.0].children.push(id);
        Ok(id)
    }

    pub fn root(&self) -> ActuatorId {
        self.root
    }

    pub fn get(&self, id: ActuatorId) -> Option<&Actuator> {
        self.actuators.get(id.0)
    }

    /// Non-reference actuator named `name`
    pub fn find(&self, name: &str) -> Option<ActuatorId> {
        self.actuators
            .iter()
            .position(|a| !a.is_reference() && a.name == name)
            .map(ActuatorId)
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    /// All actuators in declaration order: parent first, then each child's
    /// subtree in turn
    pub fn preorder(&self) -> Vec<ActuatorId> {
        let mut order = Vec::with_capacity(self.actuators.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.actuators[id.0].children.iter().rev().copied());
        }
        order
    }
}

impl std::ops::Index<ActuatorId> for ActuatorTree {
    type Output = Actuator;

    fn index(&self, id: ActuatorId) -> &Actuator {
        &self.actuators[id.0]
    }
}
