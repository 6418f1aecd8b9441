//! # Configuration Module
//!
//! This module holds the configuration surface of the selection core. A route binds
//! one [`SelectionConfig`] at startup; it is never re-parsed per request.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`GATEWAY_LB_*`)
//! - Validation that collects every problem into one error message
//! - Algorithm keys accepted in short (`RR`) or long (`round_robin`) form

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::config::ObservabilityConfig;

/// Load balancing algorithm keys
///
/// The weighted variants and least-time are named strategies whose pick rule
/// currently matches their unweighted base (see `load_balancing::choosers::weighted`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// `R`: uniform random
    Random,
    /// `RR`: per-service cursor
    RoundRobin,
    /// `WR`: weighted random
    WeightedRandom,
    /// `WRR`: weighted round-robin
    WeightedRoundRobin,
    /// `DH`: destination host hash
    DestinationHash,
    /// `SH`: source host hash
    SourceHash,
    /// `LC`: least connections
    LeastConnections,
    /// `LT`: least time
    LeastTime,
    /// `WLC`: weighted least connections
    WeightedLeastConnections,
    /// `WLT`: weighted least time
    WeightedLeastTime,
}

impl Algorithm {
    /// Every algorithm, in registration order
    pub const ALL: [Algorithm; 10] = [
        Algorithm::Random,
        Algorithm::RoundRobin,
        Algorithm::WeightedRandom,
        Algorithm::WeightedRoundRobin,
        Algorithm::DestinationHash,
        Algorithm::SourceHash,
        Algorithm::LeastConnections,
        Algorithm::LeastTime,
        Algorithm::WeightedLeastConnections,
        Algorithm::WeightedLeastTime,
    ];

    /// Short configuration key
    pub fn key(self) -> &'static str {
        match self {
            Algorithm::Random => "R",
            Algorithm::RoundRobin => "RR",
            Algorithm::WeightedRandom => "WR",
            Algorithm::WeightedRoundRobin => "WRR",
            Algorithm::DestinationHash => "DH",
            Algorithm::SourceHash => "SH",
            Algorithm::LeastConnections => "LC",
            Algorithm::LeastTime => "LT",
            Algorithm::WeightedLeastConnections => "WLC",
            Algorithm::WeightedLeastTime => "WLT",
        }
    }

    /// Long name, used for metric tags and logs
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Random => "random",
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRandom => "weighted_random",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::DestinationHash => "destination_hash",
            Algorithm::SourceHash => "source_hash",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::LeastTime => "least_time",
            Algorithm::WeightedLeastConnections => "weighted_least_connections",
            Algorithm::WeightedLeastTime => "weighted_least_time",
        }
    }

    /// Whether this is one of the weighted variants
    pub fn is_weighted(self) -> bool {
        self.unweighted() != self
    }

    /// The unweighted algorithm a weighted variant is built on
    pub fn unweighted(self) -> Algorithm {
        match self {
            Algorithm::WeightedRandom => Algorithm::Random,
            Algorithm::WeightedRoundRobin => Algorithm::RoundRobin,
            Algorithm::WeightedLeastConnections => Algorithm::LeastConnections,
            Algorithm::WeightedLeastTime => Algorithm::LeastTime,
            other => other,
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::RoundRobin
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Algorithm {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| {
                algorithm.key().eq_ignore_ascii_case(wanted)
                    || algorithm.name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| GatewayError::UnknownAlgorithm {
                algorithm: wanted.to_string(),
            })
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-route selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Algorithm used to pick an instance
    pub algorithm: Algorithm,

    /// Maximum pick attempts before giving up (>= 1)
    #[serde(alias = "maxChooseTries")]
    pub max_choose_tries: u32,

    /// Use every discovered instance when no canary rule matches
    #[serde(alias = "fallbackAllToCandidates")]
    pub fallback_all_to_candidates: bool,

    /// Treat never-probed instances as reachable
    #[serde(alias = "nullPingToReachable")]
    pub null_ping_to_reachable: bool,

    /// Metadata key prefix matched against rule names
    #[serde(alias = "candidateMetadataPrefix")]
    pub candidate_metadata_prefix: String,

    /// Rule set expression handed to the rule matcher
    #[serde(alias = "ruleSet")]
    pub rule_set: String,

    /// Metadata key holding per-instance weights
    #[serde(alias = "weightMetadataKey")]
    pub weight_metadata_key: String,

    /// Pause between failed pick attempts; zero yields to the scheduler instead
    #[serde(with = "humantime_serde", alias = "retryBackoff")]
    pub retry_backoff: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            max_choose_tries: 10,
            fallback_all_to_candidates: false,
            null_ping_to_reachable: true,
            candidate_metadata_prefix: "canary".to_string(),
            rule_set: String::new(),
            weight_metadata_key: crate::core::types::DEFAULT_WEIGHT_KEY.to_string(),
            retry_backoff: Duration::ZERO,
        }
    }
}

impl SelectionConfig {
    /// Builder-style helper to pick the algorithm
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Builder-style helper to set the retry bound
    pub fn with_max_choose_tries(mut self, tries: u32) -> Self {
        self.max_choose_tries = tries;
        self
    }

    /// Collect validation problems, prefixed with `context`
    fn collect_errors(&self, context: &str, errors: &mut Vec<String>) {
        if self.max_choose_tries == 0 {
            errors.push(format!("{}: max_choose_tries must be at least 1", context));
        }

        if self.candidate_metadata_prefix.trim().is_empty() {
            errors.push(format!("{}: candidate_metadata_prefix cannot be empty", context));
        }

        if self.weight_metadata_key.trim().is_empty() {
            errors.push(format!("{}: weight_metadata_key cannot be empty", context));
        }
    }

    /// Validate a single selection config
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();
        self.collect_errors("selection", &mut errors);
        into_result(errors)
    }
}

/// Route definition binding a logical service to its selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Route identifier
    pub id: String,

    /// Logical service the route forwards to
    pub service_id: String,

    /// Selection settings for the route
    #[serde(default)]
    pub selection: SelectionConfig,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            selection: SelectionConfig::default(),
        }
    }
}

/// Top-level balancer configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    /// Observability settings (metrics, logging)
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BalancerConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_yaml_str(&content)?;
        info!(
            path = %path.as_ref().display(),
            routes = config.routes.len(),
            "Loaded balancer configuration"
        );
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: BalancerConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        info!(
            path = %path.as_ref().display(),
            routes = config.routes.len(),
            "Loaded balancer configuration"
        );
        Ok(config)
    }

    /// Parse YAML, apply environment overrides and validate
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let mut config: BalancerConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Selection overrides apply to every route, e.g. `GATEWAY_LB_MAX_CHOOSE_TRIES=3`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GATEWAY_LB_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        let algorithm = lookup("GATEWAY_LB_ALGORITHM")
            .map(|raw| raw.parse::<Algorithm>())
            .transpose()
            .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_LB_ALGORITHM: {}", e)))?;

        let max_tries = lookup("GATEWAY_LB_MAX_CHOOSE_TRIES")
            .map(|raw| raw.trim().parse::<u32>())
            .transpose()
            .map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_LB_MAX_CHOOSE_TRIES: {}", e))
            })?;

        let fallback = lookup("GATEWAY_LB_FALLBACK_ALL_TO_CANDIDATES")
            .map(|raw| raw.trim().parse::<bool>())
            .transpose()
            .map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_LB_FALLBACK_ALL_TO_CANDIDATES: {}", e))
            })?;

        let null_ping = lookup("GATEWAY_LB_NULL_PING_TO_REACHABLE")
            .map(|raw| raw.trim().parse::<bool>())
            .transpose()
            .map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_LB_NULL_PING_TO_REACHABLE: {}", e))
            })?;

        let backoff = lookup("GATEWAY_LB_RETRY_BACKOFF")
            .map(|raw| humantime::parse_duration(raw.trim()))
            .transpose()
            .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_LB_RETRY_BACKOFF: {}", e)))?;

        for route in &mut self.routes {
            let selection = &mut route.selection;
            if let Some(algorithm) = algorithm {
                selection.algorithm = algorithm;
            }
            if let Some(tries) = max_tries {
                selection.max_choose_tries = tries;
            }
            if let Some(fallback) = fallback {
                selection.fallback_all_to_candidates = fallback;
            }
            if let Some(null_ping) = null_ping {
                selection.null_ping_to_reachable = null_ping;
            }
            if let Some(backoff) = backoff {
                selection.retry_backoff = backoff;
            }
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();
        let mut seen_ids = HashSet::new();

        for (index, route) in self.routes.iter().enumerate() {
            if route.id.trim().is_empty() {
                errors.push(format!("Route {} has empty id", index));
            } else if !seen_ids.insert(route.id.as_str()) {
                errors.push(format!("Duplicate route id found: {}", route.id));
            }

            if route.service_id.trim().is_empty() {
                errors.push(format!("Route '{}' has empty service_id", route.id));
            }

            route.selection.collect_errors(&format!("Route '{}'", route.id), &mut errors);
        }

        into_result(errors)
    }

    /// Find a route by id
    pub fn route(&self, id: &str) -> Option<&RouteDefinition> {
        self.routes.iter().find(|route| route.id == id)
    }
}

fn into_result(errors: Vec<String>) -> GatewayResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::config(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_algorithm_keys_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.key().parse::<Algorithm>().unwrap(), algorithm);
            assert_eq!(algorithm.name().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert_eq!("wlc".parse::<Algorithm>().unwrap(), Algorithm::WeightedLeastConnections);
        assert!(matches!(
            "P2C".parse::<Algorithm>(),
            Err(GatewayError::UnknownAlgorithm { .. })
        ));
    }

    #[test]
    fn test_weighted_bases() {
        assert_eq!(Algorithm::WeightedRandom.unweighted(), Algorithm::Random);
        assert_eq!(Algorithm::WeightedLeastTime.unweighted(), Algorithm::LeastTime);
        assert!(Algorithm::WeightedRoundRobin.is_weighted());
        assert!(!Algorithm::SourceHash.is_weighted());
    }

    #[test]
    fn test_selection_defaults() {
        let config = SelectionConfig::default();
        assert_eq!(config.algorithm, Algorithm::RoundRobin);
        assert_eq!(config.max_choose_tries, 10);
        assert!(config.null_ping_to_reachable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_selection_validation() {
        let mut config = SelectionConfig::default().with_max_choose_tries(0);
        config.candidate_metadata_prefix = "  ".to_string();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_choose_tries"));
        assert!(message.contains("candidate_metadata_prefix"));
    }

    #[test]
    fn test_yaml_parsing_with_aliases() {
        let yaml = r#"
routes:
  - id: users
    service_id: user-service
    selection:
      algorithm: LC
      maxChooseTries: 3
      fallbackAllToCandidates: true
      retry_backoff: 5ms
  - id: orders
    service_id: order-service
"#;
        let config: BalancerConfig = serde_yaml::from_str(yaml).unwrap();
        let users = config.route("users").unwrap();
        assert_eq!(users.selection.algorithm, Algorithm::LeastConnections);
        assert_eq!(users.selection.max_choose_tries, 3);
        assert!(users.selection.fallback_all_to_candidates);
        assert_eq!(users.selection.retry_backoff, Duration::from_millis(5));

        let orders = config.route("orders").unwrap();
        assert_eq!(orders.selection, SelectionConfig::default());
    }

    #[test]
    fn test_route_validation() {
        let mut config = BalancerConfig::default();
        config.routes.push(RouteDefinition::new("users", "user-service"));
        assert!(config.validate().is_ok());

        config.routes.push(RouteDefinition::new("users", ""));
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("Duplicate route id"));
        assert!(message.contains("empty service_id"));
    }

    #[test]
    fn test_overrides_apply_to_every_route() {
        let mut config = BalancerConfig::default();
        config.routes.push(RouteDefinition::new("a", "svc-a"));
        config.routes.push(RouteDefinition::new("b", "svc-b"));

        let vars: HashMap<&str, &str> = [
            ("GATEWAY_LB_ALGORITHM", "sh"),
            ("GATEWAY_LB_MAX_CHOOSE_TRIES", "4"),
            ("GATEWAY_LB_NULL_PING_TO_REACHABLE", "false"),
            ("GATEWAY_LB_RETRY_BACKOFF", "2ms"),
            ("GATEWAY_LB_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        for route in &config.routes {
            assert_eq!(route.selection.algorithm, Algorithm::SourceHash);
            assert_eq!(route.selection.max_choose_tries, 4);
            assert!(!route.selection.null_ping_to_reachable);
            assert_eq!(route.selection.retry_backoff, Duration::from_millis(2));
        }
        assert_eq!(config.observability.logging.level, "debug");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = BalancerConfig::default();
        let result = config.apply_overrides_from(|name| {
            (name == "GATEWAY_LB_MAX_CHOOSE_TRIES").then(|| "many".to_string())
        });
        assert!(result.unwrap_err().to_string().contains("GATEWAY_LB_MAX_CHOOSE_TRIES"));
    }
}
