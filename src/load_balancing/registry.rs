//! # Instance Health Registry
//!
//! Authoritative, concurrency-safe view of per-instance load and reachability.
//!
//! ## Concurrency Model
//!
//! - Entries live in a `DashMap` (sharded locks); a shard is only held for the
//!   duration of a lookup, never across an `.await`
//! - Each entry is an `Arc<InstanceStats>` whose connection counter and liveness flag
//!   are plain atomics, so `connect`/`disconnect`/`mark_alive` on different instances
//!   never serialize against each other
//! - `connect`/`disconnect` touch the counter while holding the entry's shard guard,
//!   so they serialize with `evict` and never count on a removed entry
//! - Snapshots handed to choosers may be stale by the time a choice is acted upon;
//!   choosers revalidate liveness instead of locking the registry

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::types::{HealthStatus, ServiceInstance};
use crate::observability::metrics::{MetricsSink, NoopMetrics, COUNTER_UNDERFLOW};

/// Mutable per-instance state
#[derive(Debug, Default)]
pub struct InstanceStats {
    connections: AtomicUsize,
    health: AtomicU8,
    total_connections: AtomicU64,
    last_connected_ms: AtomicI64,
}

impl InstanceStats {
    /// Active connections
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Current liveness
    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Connections ever opened
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    fn last_connected(&self) -> Option<DateTime<Utc>> {
        match self.last_connected_ms.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    fn increment(&self) -> usize {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.last_connected_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement without going below zero; `Err` signals an underflow attempt
    fn decrement(&self) -> Result<usize, ()> {
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| ())
    }

    fn swap_health(&self, status: HealthStatus) -> HealthStatus {
        HealthStatus::from_u8(self.health.swap(status.as_u8(), Ordering::AcqRel))
    }
}

/// Read-only pairing of an instance with a snapshot of its stats
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance: Arc<ServiceInstance>,
    pub connections: usize,
    pub health: HealthStatus,
}

impl InstanceStatus {
    pub fn id(&self) -> &str {
        &self.instance.id
    }

    /// Whether the snapshot permits selection under the given policy
    pub fn is_reachable(&self, null_ping_to_reachable: bool) -> bool {
        self.health.is_reachable(null_ping_to_reachable)
    }
}

/// Serializable per-instance statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatsSnapshot {
    pub instance_id: String,
    pub address: String,
    pub active_connections: usize,
    pub total_connections: u64,
    pub health: HealthStatus,
    pub last_connected: Option<DateTime<Utc>>,
}

/// Registry-wide statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub unknown_instances: usize,
    pub active_connections: usize,
}

/// Liveness transition published by `mark_alive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChangeEvent {
    pub instance_id: String,
    pub service_id: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
}

struct InstanceEntry {
    instance: Arc<ServiceInstance>,
    /// Service key the instance is indexed under
    service_id: String,
    stats: Arc<InstanceStats>,
}

impl InstanceEntry {
    fn new(service_id: &str, instance: &ServiceInstance) -> Self {
        Self {
            instance: Arc::new(instance.clone()),
            service_id: service_id.to_string(),
            stats: Arc::new(InstanceStats::default()),
        }
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance: self.instance.clone(),
            connections: self.stats.connections(),
            health: self.stats.health(),
        }
    }
}

/// Registry of instance connection counters and liveness flags
pub struct InstanceHealthRegistry {
    /// Entries indexed by instance id
    instances: DashMap<String, InstanceEntry>,
    /// Instance ids per service, in first-observed order
    services: DashMap<String, Vec<String>>,
    change_sender: broadcast::Sender<HealthChangeEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl InstanceHealthRegistry {
    /// Create an empty registry that does not report metrics
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    /// Create an empty registry reporting underflows to `metrics`
    pub fn with_metrics(metrics: Arc<dyn MetricsSink>) -> Self {
        let (change_sender, _) = broadcast::channel(1024);

        Self {
            instances: DashMap::new(),
            services: DashMap::new(),
            change_sender,
            metrics,
        }
    }

    /// Record instances discovery listed for `service_id`
    ///
    /// Membership is keyed by the id the instances were looked up under, not by
    /// their own `service_id` field. Unknown ids get a fresh stats entry; known ids
    /// keep their counters and only pick up the new metadata.
    pub fn observe(&self, service_id: &str, instances: &[ServiceInstance]) {
        for instance in instances {
            self.observe_one(service_id, instance);
        }
    }

    fn observe_one(&self, service_id: &str, instance: &ServiceInstance) -> Arc<InstanceStats> {
        let stats = {
            let mut entry = self
                .instances
                .entry(instance.id.clone())
                .or_insert_with(|| InstanceEntry::new(service_id, instance));
            if *entry.instance != *instance {
                entry.instance = Arc::new(instance.clone());
            }
            entry.stats.clone()
        };

        self.add_member(service_id, &instance.id);
        stats
    }

    fn add_member(&self, service_id: &str, instance_id: &str) {
        let mut members = self.services.entry(service_id.to_string()).or_default();
        if !members.iter().any(|id| id == instance_id) {
            members.push(instance_id.to_string());
            debug!(service = service_id, instance_id, "Observed new instance");
        }
    }

    fn stats_for(&self, instance: &ServiceInstance) -> Arc<InstanceStats> {
        match self.instances.get(&instance.id) {
            Some(entry) => entry.stats.clone(),
            None => self.observe_one(&instance.service_id, instance),
        }
    }

    /// All known instances of a service, reachable or not
    pub fn get_all_instances(&self, service_id: &str) -> Vec<InstanceStatus> {
        let ids = match self.services.get(service_id) {
            Some(members) => members.clone(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.instances.get(id).map(|entry| entry.status()))
            .collect()
    }

    /// Instances of a service whose liveness permits selection
    pub fn get_reachable_instances(
        &self,
        service_id: &str,
        null_ping_to_reachable: bool,
    ) -> Vec<InstanceStatus> {
        self.get_all_instances(service_id)
            .into_iter()
            .filter(|status| status.is_reachable(null_ping_to_reachable))
            .collect()
    }

    /// Current snapshot of one instance, observing it if needed
    pub fn status_of(&self, instance: &ServiceInstance) -> InstanceStatus {
        let stats = self.stats_for(instance);
        InstanceStatus {
            instance: self
                .instances
                .get(&instance.id)
                .map(|entry| entry.instance.clone())
                .unwrap_or_else(|| Arc::new(instance.clone())),
            connections: stats.connections(),
            health: stats.health(),
        }
    }

    /// Register a new connection and return the updated count
    ///
    /// An instance never observed is indexed under its own `service_id`.
    pub fn connect(&self, instance: &ServiceInstance) -> usize {
        let mut created = false;
        let count = self
            .instances
            .entry(instance.id.clone())
            .or_insert_with(|| {
                created = true;
                InstanceEntry::new(&instance.service_id, instance)
            })
            .stats
            .increment();

        if created {
            self.add_member(&instance.service_id, &instance.id);
        }
        count
    }

    /// Release a connection and return the updated count
    ///
    /// Never goes below zero. A release without a matching `connect` is logged and
    /// counted, not propagated.
    pub fn disconnect(&self, instance_id: &str) -> usize {
        let released = match self.instances.get(instance_id) {
            Some(entry) => entry.stats.decrement(),
            None => {
                warn!(instance_id, "Disconnect for unknown instance");
                self.record_underflow(instance_id);
                return 0;
            }
        };

        match released {
            Ok(remaining) => remaining,
            Err(()) => {
                warn!(instance_id, "Connection counter underflow, clamped to zero");
                self.record_underflow(instance_id);
                0
            }
        }
    }

    fn record_underflow(&self, instance_id: &str) {
        self.metrics.increment_counter(
            COUNTER_UNDERFLOW,
            &[("instance", instance_id.to_string())],
            1,
        );
    }

    /// Record a liveness verdict from the health probe
    ///
    /// Returns the previous status. Subscribers are notified on transitions only.
    pub fn mark_alive(
        &self,
        instance_id: &str,
        status: impl Into<HealthStatus>,
    ) -> Option<HealthStatus> {
        let status = status.into();
        let (stats, service_id) = {
            let entry = self.instances.get(instance_id)?;
            (entry.stats.clone(), entry.service_id.clone())
        };

        let old_status = stats.swap_health(status);
        if old_status != status {
            debug!(instance_id, %old_status, new_status = %status, "Instance health changed");
            // No receivers is fine
            let _ = self.change_sender.send(HealthChangeEvent {
                instance_id: instance_id.to_string(),
                service_id,
                old_status,
                new_status: status,
            });
        }

        Some(old_status)
    }

    /// Whether an instance may receive traffic right now
    pub fn is_alive(&self, instance_id: &str, null_ping_to_reachable: bool) -> bool {
        self.instances
            .get(instance_id)
            .map(|entry| entry.stats.health().is_reachable(null_ping_to_reachable))
            .unwrap_or(false)
    }

    /// Active connections of an instance (0 when unknown)
    pub fn connections(&self, instance_id: &str) -> usize {
        self.instances
            .get(instance_id)
            .map(|entry| entry.stats.connections())
            .unwrap_or(0)
    }

    /// Remove an idle instance
    ///
    /// Instances with active connections are kept so their counters stay paired.
    pub fn evict(&self, instance_id: &str) -> bool {
        let service_id = match self
            .instances
            .remove_if(instance_id, |_, entry| entry.stats.connections() == 0)
        {
            Some((_, entry)) => entry.service_id,
            None => {
                if self.instances.contains_key(instance_id) {
                    warn!(instance_id, "Refusing to evict instance with active connections");
                }
                return false;
            }
        };

        if let Some(mut members) = self.services.get_mut(&service_id) {
            members.retain(|id| id != instance_id);
        }
        self.services.remove_if(&service_id, |_, members| members.is_empty());

        debug!(instance_id, service = %service_id, "Evicted instance");
        true
    }

    /// Subscribe to health change events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Serializable stats of every instance of a service
    pub fn snapshot(&self, service_id: &str) -> Vec<InstanceStatsSnapshot> {
        let ids = self
            .services
            .get(service_id)
            .map(|members| members.clone())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| {
                self.instances.get(id).map(|entry| InstanceStatsSnapshot {
                    instance_id: entry.instance.id.clone(),
                    address: entry.instance.authority(),
                    active_connections: entry.stats.connections(),
                    total_connections: entry.stats.total_connections(),
                    health: entry.stats.health(),
                    last_connected: entry.stats.last_connected(),
                })
            })
            .collect()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_services: self.services.len(),
            total_instances: 0,
            healthy_instances: 0,
            unhealthy_instances: 0,
            unknown_instances: 0,
            active_connections: 0,
        };

        for entry in self.instances.iter() {
            stats.total_instances += 1;
            stats.active_connections += entry.stats.connections();
            match entry.stats.health() {
                HealthStatus::Healthy => stats.healthy_instances += 1,
                HealthStatus::Unhealthy => stats.unhealthy_instances += 1,
                HealthStatus::Unknown => stats.unknown_instances += 1,
            }
        }

        stats
    }
}

impl std::fmt::Debug for InstanceHealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHealthRegistry")
            .field("services", &self.services.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Default for InstanceHealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::InMemoryMetrics;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "svc", "10.0.0.1", 8080)
    }

    #[test]
    fn test_observe_keeps_order_and_counters() {
        let registry = InstanceHealthRegistry::new();
        registry.observe("svc", &[instance("a"), instance("b")]);
        registry.connect(&instance("b"));

        let updated = instance("b").with_metadata("canary", "beta");
        registry.observe("svc", &[updated.clone(), instance("c")]);

        let all = registry.get_all_instances("svc");
        let ids: Vec<_> = all.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(all[1].connections, 1);
        assert_eq!(*all[1].instance, updated);
    }

    #[test]
    fn test_membership_follows_lookup_key() {
        let registry = InstanceHealthRegistry::new();
        let upper = ServiceInstance::new("a", "USERS", "10.0.0.1", 8080);
        registry.observe("users", &[upper.clone()]);
        let mut events = registry.subscribe();
        registry.mark_alive("a", true);

        assert_eq!(registry.get_reachable_instances("users", false).len(), 1);
        assert!(registry.get_all_instances("USERS").is_empty());
        assert_eq!(events.try_recv().unwrap().service_id, "users");

        registry.connect(&upper);
        assert_eq!(registry.get_all_instances("users")[0].connections, 1);
        assert_eq!(registry.stats().total_services, 1);

        registry.disconnect("a");
        assert!(registry.evict("a"));
        assert_eq!(registry.stats().total_services, 0);
    }

    #[test]
    fn test_reachable_respects_null_ping_policy() {
        let registry = InstanceHealthRegistry::new();
        registry.observe("svc", &[instance("a"), instance("b"), instance("c")]);
        registry.mark_alive("a", true);
        registry.mark_alive("b", false);

        let lenient: Vec<_> = registry
            .get_reachable_instances("svc", true)
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        let strict: Vec<_> = registry
            .get_reachable_instances("svc", false)
            .iter()
            .map(|s| s.id().to_string())
            .collect();

        assert_eq!(lenient, vec!["a", "c"]);
        assert_eq!(strict, vec!["a"]);
        assert_eq!(registry.get_all_instances("svc").len(), 3);
    }

    #[test]
    fn test_connect_creates_entry_lazily() {
        let registry = InstanceHealthRegistry::new();
        assert_eq!(registry.connect(&instance("a")), 1);
        assert_eq!(registry.connect(&instance("a")), 2);
        assert_eq!(registry.disconnect("a"), 1);
        assert_eq!(registry.connections("a"), 1);
        assert_eq!(registry.get_all_instances("svc").len(), 1);
    }

    #[test]
    fn test_disconnect_underflow_is_clamped() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let registry = InstanceHealthRegistry::with_metrics(metrics.clone());
        registry.connect(&instance("a"));

        assert_eq!(registry.disconnect("a"), 0);
        assert_eq!(registry.disconnect("a"), 0);
        assert_eq!(registry.disconnect("ghost"), 0);
        assert_eq!(registry.connections("a"), 0);
        assert_eq!(metrics.counter(COUNTER_UNDERFLOW), 2);
    }

    #[test]
    fn test_mark_alive_publishes_transitions() {
        let registry = InstanceHealthRegistry::new();
        registry.observe("svc", &[instance("a")]);
        let mut events = registry.subscribe();

        assert_eq!(registry.mark_alive("a", true), Some(HealthStatus::Unknown));
        assert_eq!(registry.mark_alive("a", true), Some(HealthStatus::Healthy));
        assert_eq!(registry.mark_alive("a", None::<bool>), Some(HealthStatus::Healthy));
        assert_eq!(registry.mark_alive("missing", true), None);

        let first = events.try_recv().unwrap();
        assert_eq!(first.new_status, HealthStatus::Healthy);
        assert_eq!(first.service_id, "svc");
        let second = events.try_recv().unwrap();
        assert_eq!(second.new_status, HealthStatus::Unknown);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_evict_refuses_active_instances() {
        let registry = InstanceHealthRegistry::new();
        registry.connect(&instance("a"));
        registry.observe("svc", &[instance("b")]);

        assert!(!registry.evict("a"));
        assert!(registry.evict("b"));
        assert!(!registry.evict("b"));

        registry.disconnect("a");
        assert!(registry.evict("a"));
        assert_eq!(registry.stats().total_services, 0);
    }

    #[test]
    fn test_stats_and_snapshot() {
        let registry = InstanceHealthRegistry::new();
        registry.observe("svc", &[instance("a"), instance("b")]);
        registry.mark_alive("a", true);
        registry.connect(&instance("a"));
        registry.connect(&instance("a"));

        let stats = registry.stats();
        assert_eq!(stats.total_instances, 2);
        assert_eq!(stats.healthy_instances, 1);
        assert_eq!(stats.unknown_instances, 1);
        assert_eq!(stats.active_connections, 2);

        let snapshot = registry.snapshot("svc");
        assert_eq!(snapshot[0].total_connections, 2);
        assert!(snapshot[0].last_connected.is_some());
        assert!(snapshot[1].last_connected.is_none());
    }
}
