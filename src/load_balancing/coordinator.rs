//! # Selection Coordinator
//!
//! Per-request orchestration of instance selection:
//!
//! ```text
//! ResolveService → ResolveCandidates → Dispatch
//!     → Success | NoCandidates | NoInstance | RetriesExhausted
//! ```
//!
//! 1. **ResolveService**: the logical service id is the host of the `lb://` forwarding target
//! 2. **ResolveCandidates**: discovery lists the raw instances, the rule matcher names the
//!    canary rules that apply, and instances are filtered by their canary metadata
//! 3. **Dispatch**: the chooser bound to the route picks one instance
//! 4. **Success**: the instance is connected and the forwarding target rewritten; the
//!    returned [`Selection`] disconnects it exactly once when dropped
//!
//! Every call records one `load_balancer_selection_duration` observation, measured from
//! the start of Dispatch. Calls that fail before Dispatch record a zero duration.
//!
//! Route configuration is validated and its chooser resolved once, in
//! [`SelectionCoordinator::bind`]. Configuration problems therefore surface at startup,
//! never per request.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::core::config::{Algorithm, SelectionConfig};
use crate::core::error::GatewayResult;
use crate::core::types::{RequestContext, ServiceInstance};
use crate::discovery::ServiceDiscovery;
use crate::load_balancing::balancer::ChooserRegistry;
use crate::load_balancing::choosers::{ChooseContext, Chooser};
use crate::load_balancing::failure::SelectionFailure;
use crate::load_balancing::registry::{InstanceHealthRegistry, InstanceStatus};
use crate::observability::metrics::{
    MetricsSink, FAILED_SELECTIONS, NO_CANDIDATES, NO_INSTANCES, SELECTIONS, SELECTION_DURATION,
};
use crate::routing::RuleMatcher;

/// Outcome of a selection
pub type SelectionResult = Result<Selection, SelectionFailure>;

/// Route configuration with its chooser resolved
#[derive(Clone)]
pub struct BoundRoute {
    config: SelectionConfig,
    chooser: Arc<dyn Chooser>,
}

impl BoundRoute {
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    /// Name of the chooser handling this route (may be the fallback)
    pub fn chooser_name(&self) -> &'static str {
        self.chooser.name()
    }
}

impl std::fmt::Debug for BoundRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundRoute")
            .field("config", &self.config)
            .field("chooser", &self.chooser.name())
            .finish()
    }
}

/// Holds one registered connection to an instance
///
/// Dropping the guard (completion, error, or cancellation of the owning task) releases
/// the connection. Release happens at most once.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<InstanceHealthRegistry>,
    instance_id: Option<String>,
}

impl ConnectionGuard {
    /// Connect to `instance` and guard the connection
    pub fn connect(registry: Arc<InstanceHealthRegistry>, instance: &ServiceInstance) -> Self {
        let connections = registry.connect(instance);
        debug!(instance_id = %instance.id, connections, "Connection opened");

        Self {
            registry,
            instance_id: Some(instance.id.clone()),
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Release the connection now; returns the remaining connection count
    pub fn release(mut self) -> usize {
        self.disconnect().unwrap_or(0)
    }

    fn disconnect(&mut self) -> Option<usize> {
        let instance_id = self.instance_id.take()?;
        let remaining = self.registry.disconnect(&instance_id);
        debug!(instance_id = %instance_id, connections = remaining, "Connection released");
        Some(remaining)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A chosen instance together with its connection
#[derive(Debug)]
pub struct Selection {
    pub instance: Arc<ServiceInstance>,
    guard: ConnectionGuard,
}

impl Selection {
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn guard(&self) -> &ConnectionGuard {
        &self.guard
    }

    /// Run the forwarded exchange while holding the connection
    ///
    /// The connection is released when `exchange` resolves or when the returned future
    /// is dropped before completion.
    pub async fn exchange<F, T>(self, exchange: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.guard;
        exchange.await
    }

    /// Release the connection without running an exchange
    pub fn release(self) -> usize {
        self.guard.release()
    }

    pub fn into_parts(self) -> (Arc<ServiceInstance>, ConnectionGuard) {
        (self.instance, self.guard)
    }
}

/// Per-request selection state machine
pub struct SelectionCoordinator {
    discovery: Arc<dyn ServiceDiscovery>,
    matcher: Arc<dyn RuleMatcher>,
    metrics: Arc<dyn MetricsSink>,
    registry: Arc<InstanceHealthRegistry>,
    choosers: Arc<ChooserRegistry>,
}

impl SelectionCoordinator {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        matcher: Arc<dyn RuleMatcher>,
        metrics: Arc<dyn MetricsSink>,
        registry: Arc<InstanceHealthRegistry>,
        choosers: Arc<ChooserRegistry>,
    ) -> Self {
        Self {
            discovery,
            matcher,
            metrics,
            registry,
            choosers,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceHealthRegistry> {
        &self.registry
    }

    /// Validate a route's selection config and resolve its chooser
    pub fn bind(&self, config: SelectionConfig) -> GatewayResult<BoundRoute> {
        config.validate()?;
        let chooser = self.choosers.resolve(config.algorithm)?;

        info!(
            algorithm = config.algorithm.key(),
            chooser = chooser.name(),
            max_choose_tries = config.max_choose_tries,
            fallback_all_to_candidates = config.fallback_all_to_candidates,
            null_ping_to_reachable = config.null_ping_to_reachable,
            "Bound selection config"
        );

        Ok(BoundRoute { config, chooser })
    }

    /// Select an instance for the request and rewrite its forwarding target
    pub async fn route(&self, request: &mut RequestContext, route: &BoundRoute) -> SelectionResult {
        let service_id = match request.service_id() {
            Some(service_id) => service_id.to_string(),
            None => {
                warn!(target_url = %request.target, "Forwarding target has no service id");
                let failure = SelectionFailure::NoInstancesRegistered {
                    service: String::new(),
                };
                self.record_failure(&failure, route.algorithm());
                return Err(failure);
            }
        };

        let selection = self.select_instance(&service_id, request, route).await?;

        match forward_target(&request.target, &selection.instance) {
            Some(target) => {
                debug!(from = %request.target, to = %target, "Rewrote forwarding target");
                request.target = target;
                Ok(selection)
            }
            None => {
                warn!(
                    service = %service_id,
                    instance_id = %selection.instance.id,
                    "Chosen instance does not form a valid forwarding URL"
                );
                let failure = SelectionFailure::InvalidTarget {
                    service: service_id,
                    instance_id: selection.instance.id.clone(),
                };
                self.record_failure(&failure, route.algorithm());
                Err(failure)
            }
        }
    }

    /// Resolve candidates for `service_id`, dispatch to the route's chooser and connect
    #[instrument(
        skip(self, request, route),
        fields(algorithm = route.algorithm().key(), request_id = %request.id)
    )]
    pub async fn select_instance(
        &self,
        service_id: &str,
        request: &RequestContext,
        route: &BoundRoute,
    ) -> SelectionResult {
        let algorithm = route.algorithm();

        let resolved = self.resolve_candidates(service_id, request, route.config()).await;
        let (result, elapsed) = match resolved {
            Ok(candidates) => {
                let started = Instant::now();
                let result = self.dispatch(service_id, request, route, &candidates).await;
                (result, started.elapsed())
            }
            Err(failure) => (Err(failure), Duration::ZERO),
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(failure) => failure.reason(),
        };
        self.metrics.record_timer(
            SELECTION_DURATION,
            &[
                ("algorithm", algorithm.name().to_string()),
                ("service", service_id.to_string()),
                ("outcome", outcome.to_string()),
            ],
            elapsed,
        );

        match result {
            Ok(instance) => {
                let guard = ConnectionGuard::connect(self.registry.clone(), &instance);
                self.metrics.increment_counter(
                    SELECTIONS,
                    &[
                        ("algorithm", algorithm.name().to_string()),
                        ("service", service_id.to_string()),
                    ],
                    1,
                );
                debug!(
                    service = service_id,
                    instance_id = %instance.id,
                    address = %instance.authority(),
                    "Instance selected"
                );
                Ok(Selection { instance, guard })
            }
            Err(failure) => {
                self.record_failure(&failure, algorithm);
                Err(failure)
            }
        }
    }

    async fn resolve_candidates(
        &self,
        service_id: &str,
        request: &RequestContext,
        config: &SelectionConfig,
    ) -> Result<Vec<ServiceInstance>, SelectionFailure> {
        let instances = match self.discovery.list_instances(service_id).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = service_id, error = %e, "Service discovery failed");
                Vec::new()
            }
        };

        if instances.is_empty() {
            warn!(service = service_id, "No instances available for service");
            self.metrics
                .increment_counter(NO_INSTANCES, &[("service", service_id.to_string())], 1);
            return Err(SelectionFailure::NoInstancesRegistered {
                service: service_id.to_string(),
            });
        }

        self.registry.observe(service_id, &instances);

        let matched = self.matcher.match_rules(request, &config.rule_set).await;
        if matched.is_empty() {
            if config.fallback_all_to_candidates {
                debug!(
                    service = service_id,
                    instances = instances.len(),
                    "No rule matched, using all instances"
                );
                return Ok(instances);
            }
            return Err(self.no_candidates(service_id, "no canary rule matched"));
        }

        let candidates: Vec<_> = instances
            .into_iter()
            .filter(|instance| {
                matched
                    .iter()
                    .any(|rule| instance.matches_candidate(&config.candidate_metadata_prefix, rule))
            })
            .collect();

        if candidates.is_empty() {
            return Err(self.no_candidates(service_id, "no instance carries a matched canary rule"));
        }

        debug!(
            service = service_id,
            rules = ?matched,
            candidates = candidates.len(),
            "Resolved canary candidates"
        );
        Ok(candidates)
    }

    fn no_candidates(&self, service_id: &str, detail: &'static str) -> SelectionFailure {
        warn!(service = service_id, detail, "No candidate instances");
        self.metrics
            .increment_counter(NO_CANDIDATES, &[("service", service_id.to_string())], 1);
        SelectionFailure::NoCandidateMatch {
            service: service_id.to_string(),
        }
    }

    async fn dispatch(
        &self,
        service_id: &str,
        request: &RequestContext,
        route: &BoundRoute,
        candidates: &[ServiceInstance],
    ) -> Result<Arc<ServiceInstance>, SelectionFailure> {
        let statuses: Vec<InstanceStatus> = candidates
            .iter()
            .map(|instance| self.registry.status_of(instance))
            .collect();

        let ctx = ChooseContext {
            service_id,
            config: route.config(),
            request,
            registry: &self.registry,
            metrics: self.metrics.as_ref(),
        };

        route.chooser.choose(&statuses, &ctx).await
    }

    fn record_failure(&self, failure: &SelectionFailure, algorithm: Algorithm) {
        self.metrics.increment_counter(
            FAILED_SELECTIONS,
            &[
                ("reason", failure.reason().to_string()),
                ("algorithm", algorithm.name().to_string()),
                ("service", failure.service().to_string()),
            ],
            1,
        );
    }
}

impl std::fmt::Debug for SelectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionCoordinator")
            .field("choosers", &self.choosers)
            .field("registry", &self.registry.stats())
            .finish()
    }
}

/// `scheme://host:port` of the instance with the original path and query
fn forward_target(original: &Url, instance: &ServiceInstance) -> Option<Url> {
    let mut raw = format!("{}{}", instance.url(), original.path());
    if let Some(query) = original.query() {
        raw.push('?');
        raw.push_str(query);
    }
    Url::parse(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::observability::metrics::InMemoryMetrics;
    use crate::routing::PredicateRuleMatcher;

    fn coordinator(
        discovery: Arc<StaticDiscovery>,
        metrics: Arc<InMemoryMetrics>,
    ) -> SelectionCoordinator {
        SelectionCoordinator::new(
            discovery,
            Arc::new(PredicateRuleMatcher::new()),
            metrics,
            Arc::new(InstanceHealthRegistry::new()),
            Arc::new(ChooserRegistry::with_defaults()),
        )
    }

    #[test]
    fn test_forward_target_keeps_path_and_query() {
        let original = Url::parse("lb://users/api/v1/users?page=2&sort=name").unwrap();
        let instance = ServiceInstance::new("a", "users", "10.0.0.7", 9090);

        let target = forward_target(&original, &instance).unwrap();
        assert_eq!(target.as_str(), "http://10.0.0.7:9090/api/v1/users?page=2&sort=name");

        let secure = forward_target(&original, &instance.clone().with_secure(true)).unwrap();
        assert_eq!(secure.scheme(), "https");
    }

    #[test]
    fn test_forward_target_rejects_bad_host() {
        let original = Url::parse("lb://users/").unwrap();
        let instance = ServiceInstance::new("a", "users", "bad host", 80);
        assert!(forward_target(&original, &instance).is_none());
    }

    #[test]
    fn test_guard_releases_once() {
        let registry = Arc::new(InstanceHealthRegistry::new());
        let instance = ServiceInstance::new("a", "users", "10.0.0.1", 80);

        let guard = ConnectionGuard::connect(registry.clone(), &instance);
        let second = ConnectionGuard::connect(registry.clone(), &instance);
        assert_eq!(registry.connections("a"), 2);

        assert_eq!(guard.release(), 1);
        drop(second);
        assert_eq!(registry.connections("a"), 0);
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let coordinator = coordinator(Arc::new(StaticDiscovery::new()), metrics);

        let error = coordinator
            .bind(SelectionConfig::default().with_max_choose_tries(0))
            .unwrap_err();
        assert!(error.is_configuration());
    }

    #[tokio::test]
    async fn test_missing_service_id_fails() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let coordinator = coordinator(Arc::new(StaticDiscovery::new()), metrics.clone());
        let route = coordinator.bind(SelectionConfig::default()).unwrap();

        let mut request = RequestContext::new(Url::parse("lb:opaque").unwrap());
        let result = coordinator.route(&mut request, &route).await;

        assert!(matches!(result, Err(SelectionFailure::NoInstancesRegistered { .. })));
        assert_eq!(metrics.counter_with(FAILED_SELECTIONS, &[("reason", "no-instances")]), 1);
    }

    #[tokio::test]
    async fn test_invalid_instance_address_releases_connection() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.add_instance(ServiceInstance::new("a", "users", "bad host", 80));
        let metrics = Arc::new(InMemoryMetrics::new());
        let coordinator = coordinator(discovery, metrics.clone());
        let route = coordinator
            .bind(SelectionConfig {
                fallback_all_to_candidates: true,
                ..SelectionConfig::default()
            })
            .unwrap();

        let mut request = RequestContext::new(Url::parse("lb://users/").unwrap());
        let result = coordinator.route(&mut request, &route).await;

        assert!(matches!(result, Err(SelectionFailure::InvalidTarget { .. })));
        assert_eq!(coordinator.registry().connections("a"), 0);
        assert_eq!(request.target.as_str(), "lb://users/");
    }
}
