// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Context scope
//!
//! The scope is the live context a dataflow runs in: it owns the context
//! observations, hands out observation ids, carries the cancellation flag and
//! publishes lifecycle messages on a channel for monitoring layers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam::channel::{unbounded, Receiver, Sender};
use klab_geometry::Geometry;
use klab_storage::{StorageManager, StorageType};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::observation::{Observation, ObservationKind};
use crate::{DataflowError, DataflowResult};

/// Contextualization progress of one actuator
#[derive(Debug, Clone)]
pub enum LifecycleMessage {
    ContextualizationStarted {
        actuator: String,
        observation: Option<Arc<Observation>>,
    },
    ContextualizationAborted {
        actuator: String,
        observation: Option<Arc<Observation>>,
        cause: Arc<DataflowError>,
    },
    ContextualizationSuccessful {
        actuator: String,
        observation: Option<Arc<Observation>>,
    },
}

impl LifecycleMessage {
    pub fn actuator(&self) -> &str {
        match self {
            LifecycleMessage::ContextualizationStarted { actuator, .. }
            | LifecycleMessage::ContextualizationAborted { actuator, .. }
            | LifecycleMessage::ContextualizationSuccessful { actuator, .. } => actuator,
        }
    }

    pub fn observation(&self) -> Option<&Arc<Observation>> {
        match self {
            LifecycleMessage::ContextualizationStarted { observation, .. }
            | LifecycleMessage::ContextualizationAborted { observation, .. }
            | LifecycleMessage::ContextualizationSuccessful { observation, .. } => observation.as_ref(),
        }
    }
}

pub struct ContextScope {
    context_urn: String,
    geometry: Arc<Geometry>,
    storage: Arc<StorageManager>,
    next_id: AtomicI64,
    observations: RwLock<AHashMap<i64, Arc<Observation>>>,
    names: RwLock<AHashMap<String, i64>>,
    sender: Sender<LifecycleMessage>,
    receiver: Receiver<LifecycleMessage>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextScope")
            .field("context", &self.context_urn)
            .field("geometry", &self.geometry.to_string())
            .field("observations", &self.observations.read().len())
            .finish()
    }
}

impl ContextScope {
    pub fn new(context_urn: impl Into<String>, geometry: Arc<Geometry>, storage: Arc<StorageManager>) -> Self {
        let context_urn = context_urn.into();
        info!(target: "klab-dataflow", "Opened context {} over {}", context_urn, geometry);
        let (sender, receiver) = unbounded();
        Self {
            context_urn,
            geometry,
            storage,
            next_id: AtomicI64::new(1),
            observations: RwLock::new(AHashMap::new()),
            names: RwLock::new(AHashMap::new()),
            sender,
            receiver,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context_urn(&self) -> &str {
        &self.context_urn
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    pub fn storage_manager(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Create an observation with a fresh id
    ///
    /// Quality observations get a storage from the manager, with options
    /// taken from `annotations` when present.
    ///
    /// # Errors
    ///
    /// `Storage` if the storage cannot be created
    pub fn create_observation(
        &self,
        name: &str,
        kind: ObservationKind,
        geometry: Arc<Geometry>,
        storage_type: Option<StorageType>,
        annotations: &HashMap<String, String>,
    ) -> DataflowResult<Arc<Observation>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let urn = format!("{}.{}", self.context_urn, id);
        let storage = if kind.is_quality() {
            let options = self
                .storage
                .options_with_annotations(&geometry, storage_type, annotations)?;
            Some(self.storage.storage(&urn, geometry.clone(), options)?)
        } else {
            None
        };

        let observation = Arc::new(Observation::new(id, name.to_string(), urn, kind, geometry, storage));
        debug!(target: "klab-dataflow", "Created {}", observation);
        self.observations.write().insert(id, observation.clone());
        self.names.write().insert(name.to_string(), id);
        Ok(observation)
    }

    pub fn observation(&self, id: i64) -> Option<Arc<Observation>> {
        self.observations.read().get(&id).cloned()
    }

    /// Most recently created observation named `name`
    pub fn observation_named(&self, name: &str) -> Option<Arc<Observation>> {
        let id = *self.names.read().get(name)?;
        self.observation(id)
    }

    /// Drop observation `id` and release its storage
    ///
    /// The name falls back to the newest remaining observation with that name.
    pub fn remove_observation(&self, id: i64) -> Option<Arc<Observation>> {
        let removed = self.observations.write().remove(&id)?;
        {
            let observations = self.observations.read();
            let mut names = self.names.write();
            if names.get(removed.name()) == Some(&id) {
                match observations.values().filter(|o| o.name() == removed.name()).map(|o| o.id()).max() {
                    Some(previous) => names.insert(removed.name().to_string(), previous),
                    None => names.remove(removed.name()),
                };
            }
        }
        if removed.storage().is_some() {
            self.storage.release(removed.urn());
        }
        debug!(target: "klab-dataflow", "Removed {}", removed);
        Some(removed)
    }

    pub fn observation_count(&self) -> usize {
        self.observations.read().len()
    }

    pub fn send(&self, message: LifecycleMessage) {
        // the scope holds a receiver, so the channel never disconnects
        let _ = self.sender.send(message);
    }

    /// Receiving end of the lifecycle channel; every clone competes for messages
    pub fn messages(&self) -> Receiver<LifecycleMessage> {
        self.receiver.clone()
    }

    /// Take all lifecycle messages sent so far
    pub fn drain_messages(&self) -> Vec<LifecycleMessage> {
        self.receiver.try_iter().collect()
    }

    pub fn cancel(&self) {
        info!(target: "klab-dataflow", "Cancelling contextualization in {}", self.context_urn);
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Shared flag for long-running steps
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}
