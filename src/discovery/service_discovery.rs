//! # Service Discovery
//!
//! The selection core only needs one thing from discovery: the current instance list of
//! a logical service. Backends (Kubernetes, Consul, NATS, ...) implement
//! [`ServiceDiscovery`] outside this crate; [`StaticDiscovery`] is the in-memory
//! implementation used for fixed deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::ServiceInstance;

/// Source of instance lists, consulted once per selection
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Current instances of `service_id`; empty when the service is unknown
    async fn list_instances(&self, service_id: &str) -> GatewayResult<Vec<ServiceInstance>>;
}

/// Membership change published by [`StaticDiscovery`]
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceChangeEvent {
    /// An instance was added or updated
    InstanceRegistered(ServiceInstance),
    /// An instance was removed
    InstanceDeregistered { service_id: String, instance_id: String },
    /// The whole instance list of a service was replaced
    ServiceReplaced { service_id: String, instances: usize },
}

/// Type alias for service change event receiver
pub type ServiceChangeReceiver = broadcast::Receiver<ServiceChangeEvent>;

/// Static service discovery for testing and simple deployments
///
/// Instance lists keep insertion order, which is the candidate order choosers see.
pub struct StaticDiscovery {
    services: DashMap<String, Vec<ServiceInstance>>,
    change_sender: broadcast::Sender<ServiceChangeEvent>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (change_sender, _) = broadcast::channel(100);
        Self {
            services: DashMap::new(),
            change_sender,
        }
    }

    /// Add an instance, replacing any instance with the same id in place
    pub fn add_instance(&self, instance: ServiceInstance) {
        {
            let mut instances = self.services.entry(instance.service_id.clone()).or_default();
            match instances.iter_mut().find(|existing| existing.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => instances.push(instance.clone()),
            }
        }

        debug!(
            service = %instance.service_id,
            instance_id = %instance.id,
            "Registered static instance"
        );
        let _ = self.change_sender.send(ServiceChangeEvent::InstanceRegistered(instance));
    }

    /// Remove an instance; returns whether it was present
    pub fn remove_instance(&self, service_id: &str, instance_id: &str) -> bool {
        let removed = match self.services.get_mut(service_id) {
            Some(mut instances) => {
                let before = instances.len();
                instances.retain(|instance| instance.id != instance_id);
                instances.len() != before
            }
            None => false,
        };

        if removed {
            let _ = self.change_sender.send(ServiceChangeEvent::InstanceDeregistered {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        removed
    }

    /// Replace the instance list of a service
    pub fn set_instances(&self, service_id: &str, instances: Vec<ServiceInstance>) {
        let count = instances.len();
        self.services.insert(service_id.to_string(), instances);
        let _ = self.change_sender.send(ServiceChangeEvent::ServiceReplaced {
            service_id: service_id.to_string(),
            instances: count,
        });
    }

    /// Subscribe to membership changes
    pub fn watch_changes(&self) -> ServiceChangeReceiver {
        self.change_sender.subscribe()
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn list_instances(&self, service_id: &str) -> GatewayResult<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(service_id)
            .map(|instances| instances.clone())
            .unwrap_or_default())
    }
}
