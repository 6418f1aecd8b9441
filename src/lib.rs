//! # Gateway Balancer - Traffic Routing Core
//!
//! Instance selection for an API gateway: given a request whose forwarding target names
//! a logical service (`lb://user-service/...`), pick one concrete instance, track the
//! connection for the lifetime of the forwarded exchange, and rewrite the target.
//!
//! ## Architecture Overview
//!
//! ```text
//! request ──► SelectionCoordinator ──► ServiceDiscovery (raw instances)
//!                    │                 RuleMatcher (canary rule names)
//!                    ▼
//!              ChooserRegistry ──► Chooser ──► InstanceHealthRegistry (snapshots)
//!                    │
//!                    ▼
//!              Selection (instance + ConnectionGuard)
//! ```
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use gateway_balancer::{
//!     ChooserRegistry, InstanceHealthRegistry, PredicateRuleMatcher, RecorderSink,
//!     SelectionConfig, SelectionCoordinator, StaticDiscovery,
//! };
//! use std::sync::Arc;
//!
//! let coordinator = SelectionCoordinator::new(
//!     Arc::new(StaticDiscovery::new()),
//!     Arc::new(PredicateRuleMatcher::new()),
//!     Arc::new(RecorderSink),
//!     Arc::new(InstanceHealthRegistry::new()),
//!     Arc::new(ChooserRegistry::with_defaults()),
//! );
//! let route = coordinator.bind(SelectionConfig::default())?;
//! let selection = coordinator.route(&mut request, &route).await?;
//! let response = selection.exchange(forward(request)).await;
//! ```

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Instance health registry, chooser algorithms, strategy dispatch, and the coordinator
pub mod load_balancing;

/// Service discovery collaborator and its static implementation
pub mod discovery;

/// Canary rule matching collaborator
pub mod routing;

/// Observability features: metrics sinks and structured logging
pub mod observability;

// Re-export commonly used types for convenience
pub use crate::core::config::{Algorithm, BalancerConfig, RouteDefinition, SelectionConfig};
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{HealthStatus, RequestContext, ServiceInstance};
pub use discovery::{ServiceDiscovery, StaticDiscovery};
pub use load_balancing::{
    BoundRoute, ChooseContext, Chooser, ChooserRegistry, ConnectionGuard, InstanceHealthRegistry,
    InstanceStatus, Selection, SelectionCoordinator, SelectionFailure, SelectionResult,
};
pub use observability::{InMemoryMetrics, MetricsSink, NoopMetrics, RecorderSink};
pub use routing::{CandidateRule, PredicateRuleMatcher, RuleMatcher};
