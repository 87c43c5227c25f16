// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Runtime observations

use std::fmt;
use std::sync::Arc;

use klab_geometry::Geometry;
use klab_storage::Storage;
use serde::{Deserialize, Serialize};

/// Id of an observation that has not been created yet
pub const UNASSIGNED_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationKind {
    /// Quality values over a geometry; the only kind that owns a storage
    State,
    Object,
    Process,
    Group,
    Configuration,
    Relationship,
}

impl ObservationKind {
    pub fn is_quality(self) -> bool {
        self == ObservationKind::State
    }

    /// Kinds attached directly to the context rather than to the root observation
    pub fn belongs_to_context(self) -> bool {
        matches!(self, ObservationKind::State | ObservationKind::Process)
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObservationKind::State => "state",
            ObservationKind::Object => "object",
            ObservationKind::Process => "process",
            ObservationKind::Group => "group",
            ObservationKind::Configuration => "configuration",
            ObservationKind::Relationship => "relationship",
        };
        f.write_str(name)
    }
}

/// An artifact produced by an actuator
#[derive(Debug)]
pub struct Observation {
    id: i64,
    name: String,
    urn: String,
    kind: ObservationKind,
    geometry: Arc<Geometry>,
    storage: Option<Arc<Storage>>,
}

impl Observation {
    pub(crate) fn new(
        id: i64,
        name: String,
        urn: String,
        kind: ObservationKind,
        geometry: Arc<Geometry>,
        storage: Option<Arc<Storage>>,
    ) -> Self {
        Self {
            id,
            name,
            urn,
            kind,
            geometry,
            storage,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<context urn>.<id>`
    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn kind(&self) -> ObservationKind {
        self.kind
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    /// Values of a quality observation
    pub fn storage(&self) -> Option<&Arc<Storage>> {
        self.storage.as_ref()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.urn)
    }
}
