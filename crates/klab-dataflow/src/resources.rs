// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Resource adapters and remote resources services
//!
//! A resource URN has the form `<service>:<namespace>:<name>`. Resolution
//! prefers a locally available [`ResourceAdapter`] that handles the resource;
//! otherwise the [`ResourcesService`] registered under the URN's service id
//! contextualizes it remotely. Either way the resource is re-parameterized
//! for the observation geometry before it is bound.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use klab_geometry::Geometry;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::observation::Observation;
use crate::scope::ContextScope;
use crate::{DataflowError, DataflowResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub urn: String,
    /// Geometry the resource was contextualized to, if any
    pub geometry: Option<Arc<Geometry>>,
    pub parameters: HashMap<String, String>,
}

impl Resource {
    pub fn new(urn: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            geometry: None,
            parameters: HashMap::new(),
        }
    }

    /// Leading URN segment naming the owning service
    pub fn service_id(&self) -> &str {
        self.urn.split(':').next().unwrap_or_default()
    }
}

/// Locally available data access
pub trait ResourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, resource: &Resource) -> bool;

    /// Re-parameterize `resource` for `geometry`
    fn contextualize_resource(
        &self,
        resource: &Resource,
        geometry: &Arc<Geometry>,
        _scope: &ContextScope,
    ) -> DataflowResult<Resource> {
        let mut contextualized = resource.clone();
        contextualized.geometry = Some(geometry.clone());
        Ok(contextualized)
    }

    /// Pull the resource's values into `observation`
    fn contextualize(
        &self,
        resource: &Resource,
        observation: &Arc<Observation>,
        scope: &ContextScope,
    ) -> DataflowResult<bool>;
}

/// Remote service able to contextualize the resources it owns
pub trait ResourcesService: Send + Sync {
    fn service_id(&self) -> &str;

    /// Re-parameterize `resource` for `geometry` before it is bound
    fn contextualize_resource(
        &self,
        resource: &Resource,
        geometry: &Arc<Geometry>,
        _scope: &ContextScope,
    ) -> DataflowResult<Resource> {
        let mut contextualized = resource.clone();
        contextualized.geometry = Some(geometry.clone());
        Ok(contextualized)
    }

    fn contextualize(
        &self,
        resource: &Resource,
        observation: &Arc<Observation>,
        scope: &ContextScope,
    ) -> DataflowResult<bool>;
}

#[derive(Clone)]
pub enum ResourceHandler {
    Local(Arc<dyn ResourceAdapter>),
    Remote(Arc<dyn ResourcesService>),
}

impl fmt::Debug for ResourceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandler::Local(adapter) => write!(f, "Local({})", adapter.name()),
            ResourceHandler::Remote(service) => write!(f, "Remote({})", service.service_id()),
        }
    }
}

/// A resource bound to whoever will contextualize it
#[derive(Debug, Clone)]
pub struct BoundResource {
    pub resource: Resource,
    pub handler: ResourceHandler,
}

impl BoundResource {
    pub fn is_local(&self) -> bool {
        matches!(self.handler, ResourceHandler::Local(_))
    }

    pub fn contextualize(&self, observation: &Arc<Observation>, scope: &ContextScope) -> DataflowResult<bool> {
        trace!(
            target: "klab-dataflow",
            "Contextualizing {} into {} via {:?}",
            self.resource.urn,
            observation.urn(),
            self.handler
        );
        match &self.handler {
            ResourceHandler::Local(adapter) => adapter.contextualize(&self.resource, observation, scope),
            ResourceHandler::Remote(service) => service.contextualize(&self.resource, observation, scope),
        }
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    adapters: RwLock<Vec<Arc<dyn ResourceAdapter>>>,
    services: RwLock<AHashMap<String, Arc<dyn ResourcesService>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_adapter(&self, adapter: Arc<dyn ResourceAdapter>) {
        debug!(target: "klab-dataflow", "Registered resource adapter {}", adapter.name());
        self.adapters.write().push(adapter);
    }

    pub fn add_service(&self, service: Arc<dyn ResourcesService>) {
        debug!(target: "klab-dataflow", "Registered resources service {}", service.service_id());
        self.services
            .write()
            .insert(service.service_id().to_string(), service);
    }

    /// Bind `urn` for contextualization over `geometry`
    ///
    /// # Errors
    ///
    /// `Resolution` if neither an adapter nor the owning service is available
    pub fn resolve(&self, urn: &str, geometry: &Arc<Geometry>, scope: &ContextScope) -> DataflowResult<BoundResource> {
        let resource = Resource::new(urn);

        let local = self
            .adapters
            .read()
            .iter()
            .find(|a| a.can_handle(&resource))
            .cloned();
        if let Some(adapter) = local {
            let resource = adapter.contextualize_resource(&resource, geometry, scope)?;
            return Ok(BoundResource {
                resource,
                handler: ResourceHandler::Local(adapter),
            });
        }

        let service = self.services.read().get(resource.service_id()).cloned();
        match service {
            Some(service) => {
                let resource = service.contextualize_resource(&resource, geometry, scope)?;
                Ok(BoundResource {
                    resource,
                    handler: ResourceHandler::Remote(service),
                })
            }
            None => Err(DataflowError::Resolution(format!(
                "no adapter or resources service for {}",
                urn
            ))),
        }
    }
}
