//! # Core Types Module
//!
//! This module defines the foundational data structures shared by the selection core:
//! backend instances as reported by service discovery, their health state, and the
//! request context that choosers and rule matchers read from.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `Arc<T>` (Atomically Reference Counted) lets the registry and in-flight requests
//!   share one immutable `ServiceInstance` without copying it
//! - `Clone` on `ServiceInstance` is used when discovery hands out fresh snapshots
//! - `HealthStatus` is `Copy`, so it can be round-tripped through an atomic byte

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use url::Url;
use uuid::Uuid;

/// Default metadata key carrying a per-instance weight
pub const DEFAULT_WEIGHT_KEY: &str = "weight";

/// Backend instance registered under a logical service id
///
/// Instances are immutable per discovery snapshot. The core never mutates them;
/// load and liveness live in the registry instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub id: String,

    /// Logical service this instance belongs to
    pub service_id: String,

    /// Host name or IP address
    pub host: String,

    /// Port the instance listens on
    pub port: u16,

    /// Whether the instance expects TLS
    #[serde(default)]
    pub secure: bool,

    /// Metadata tags (canary membership, weight, zone, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a new instance without metadata
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            host: host.into(),
            port,
            secure: false,
            metadata: HashMap::new(),
        }
    }

    /// Builder-style helper to attach a metadata tag
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder-style helper to mark the instance as TLS-only
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// URL scheme used when forwarding to this instance
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// `host:port` authority
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the instance (`http://host:port`)
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme(), self.authority())
    }

    /// Weight read from metadata
    ///
    /// Missing, unparsable or zero values count as weight 1.
    pub fn weight(&self, key: &str) -> u32 {
        self.metadata
            .get(key)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|weight| *weight > 0)
            .unwrap_or(1)
    }

    /// Check if any metadata entry under `prefix` names `rule`
    ///
    /// Both the key prefix and the value comparison ignore ASCII case.
    pub fn matches_candidate(&self, prefix: &str, rule: &str) -> bool {
        self.metadata.iter().any(|(key, value)| {
            starts_with_ignore_case(key, prefix) && value.trim().eq_ignore_ascii_case(rule.trim())
        })
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.id, self.host, self.port)
    }
}

/// Health status of a service instance
///
/// Liveness is tri-state: an instance that has never been probed is `Unknown`,
/// and whether it may receive traffic depends on the `null_ping_to_reachable` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Instance is healthy and ready to receive traffic
    Healthy,
    /// Instance is unhealthy and should not receive traffic
    Unhealthy,
    /// Health status is unknown (e.g., not yet checked)
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Whether this status permits selection under the given policy
    pub fn is_reachable(self, null_ping_to_reachable: bool) -> bool {
        match self {
            HealthStatus::Healthy => true,
            HealthStatus::Unhealthy => false,
            HealthStatus::Unknown => null_ping_to_reachable,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl From<Option<bool>> for HealthStatus {
    fn from(alive: Option<bool>) -> Self {
        match alive {
            Some(true) => HealthStatus::Healthy,
            Some(false) => HealthStatus::Unhealthy,
            None => HealthStatus::Unknown,
        }
    }
}

impl From<bool> for HealthStatus {
    fn from(alive: bool) -> Self {
        Some(alive).into()
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Request context seen by the selection core
///
/// Carries just enough of the inbound exchange for rule matching and hashing.
/// `target` is the forwarding target; before selection it points at the logical
/// service (`lb://user-service/api/users`), afterwards at the chosen instance.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    /// Forwarding target
    pub target: Url,

    /// Request headers
    pub headers: HeaderMap,

    /// Client's remote address, when known
    pub remote_addr: Option<SocketAddr>,

    /// Free-form attributes set by earlier pipeline stages
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    /// Create a new request context with a generated ID
    pub fn new(target: Url) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            headers: HeaderMap::new(),
            remote_addr: None,
            attributes: HashMap::new(),
        }
    }

    /// Builder-style helper to set the remote address
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Builder-style helper to set the request headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Logical service id: the host of the forwarding target
    pub fn service_id(&self) -> Option<&str> {
        self.target.host_str().filter(|host| !host.is_empty())
    }

    /// Host the request originates from
    ///
    /// Prefers the socket peer address; falls back to the first `X-Forwarded-For` hop.
    pub fn source_host(&self) -> Option<String> {
        if let Some(addr) = self.remote_addr {
            return Some(addr.ip().to_string());
        }

        self.header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty())
    }

    /// Host the request is destined for
    pub fn destination_host(&self) -> Option<String> {
        self.target.host_str().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_service_instance() {
        let instance = ServiceInstance::new("instance-1", "api-service", "10.0.0.1", 8080);

        assert_eq!(instance.url(), "http://10.0.0.1:8080");
        assert_eq!(instance.with_secure(true).url(), "https://10.0.0.1:8080");
    }

    #[test]
    fn test_instance_weight() {
        let instance = ServiceInstance::new("a", "svc", "h", 1)
            .with_metadata("weight", "5")
            .with_metadata("bad", "x")
            .with_metadata("zero", "0");

        assert_eq!(instance.weight("weight"), 5);
        assert_eq!(instance.weight("bad"), 1);
        assert_eq!(instance.weight("zero"), 1);
        assert_eq!(instance.weight("missing"), 1);
    }

    #[test]
    fn test_candidate_matching_ignores_case() {
        let instance = ServiceInstance::new("a", "svc", "h", 1)
            .with_metadata("Canary-Group", "Beta");

        assert!(instance.matches_candidate("canary", "beta"));
        assert!(instance.matches_candidate("CANARY", "BETA"));
        assert!(!instance.matches_candidate("canary", "stable"));
        assert!(!instance.matches_candidate("zone", "beta"));
    }

    #[test]
    fn test_health_status_policy() {
        assert!(HealthStatus::Healthy.is_reachable(false));
        assert!(!HealthStatus::Unhealthy.is_reachable(true));
        assert!(HealthStatus::Unknown.is_reachable(true));
        assert!(!HealthStatus::Unknown.is_reachable(false));

        for status in [HealthStatus::Healthy, HealthStatus::Unhealthy, HealthStatus::Unknown] {
            assert_eq!(HealthStatus::from_u8(status.as_u8()), status);
        }
        assert_eq!(HealthStatus::from(None), HealthStatus::Unknown);
    }

    #[test]
    fn test_request_context_hosts() {
        let request = RequestContext::new(target("lb://user-service/api/users?page=2"))
            .with_remote_addr("192.168.1.7:51000".parse().unwrap());

        assert_eq!(request.service_id(), Some("user-service"));
        assert_eq!(request.source_host().as_deref(), Some("192.168.1.7"));
        assert_eq!(request.destination_host().as_deref(), Some("user-service"));
    }

    #[test]
    fn test_source_host_from_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.2".parse().unwrap());
        let request = RequestContext::new(target("lb://svc/")).with_headers(headers);

        assert_eq!(request.source_host().as_deref(), Some("203.0.113.9"));
    }
}
