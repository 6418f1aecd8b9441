//! # Configuration Tests
//!
//! Loading balancer configuration from YAML and JSON files, validation of route
//! definitions, and binding loaded routes to the coordinator.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

use gateway_balancer::observability::LogFormat;
use gateway_balancer::{
    Algorithm, BalancerConfig, ChooserRegistry, GatewayError, InstanceHealthRegistry, NoopMetrics,
    PredicateRuleMatcher, SelectionCoordinator, StaticDiscovery,
};

fn write_config(content: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const YAML_CONFIG: &str = r#"
routes:
  - id: users
    service_id: user-service
    selection:
      algorithm: WLC
      max_choose_tries: 5
      fallback_all_to_candidates: true
      candidate_metadata_prefix: release
      rule_set: users-canary
      retry_backoff: 10ms
  - id: orders
    service_id: order-service
    selection:
      algorithm: source_hash
      nullPingToReachable: false
observability:
  logging:
    level: debug
    format: text
  metrics:
    enabled: false
"#;

#[tokio::test]
async fn test_load_yaml_file() {
    let file = write_config(YAML_CONFIG, ".yaml");
    let config = BalancerConfig::load_from_file(file.path()).await.unwrap();

    assert_eq!(config.routes.len(), 2);

    let users = config.route("users").unwrap();
    assert_eq!(users.service_id, "user-service");
    assert_eq!(users.selection.algorithm, Algorithm::WeightedLeastConnections);
    assert_eq!(users.selection.max_choose_tries, 5);
    assert!(users.selection.fallback_all_to_candidates);
    assert_eq!(users.selection.candidate_metadata_prefix, "release");
    assert_eq!(users.selection.rule_set, "users-canary");
    assert_eq!(users.selection.retry_backoff, Duration::from_millis(10));

    let orders = config.route("orders").unwrap();
    assert_eq!(orders.selection.algorithm, Algorithm::SourceHash);
    assert!(!orders.selection.null_ping_to_reachable);
    assert_eq!(orders.selection.max_choose_tries, 10);

    assert_eq!(config.observability.logging.level, "debug");
    assert_eq!(config.observability.logging.format, LogFormat::Text);
    assert!(!config.observability.metrics.enabled);
}

#[tokio::test]
async fn test_load_json_file() {
    let json = r#"{
        "routes": [
            {
                "id": "inventory",
                "service_id": "inventory-service",
                "selection": { "algorithm": "LT", "maxChooseTries": 2 }
            }
        ]
    }"#;
    let file = write_config(json, ".json");
    let config = BalancerConfig::load_from_json(file.path()).await.unwrap();

    let route = config.route("inventory").unwrap();
    assert_eq!(route.selection.algorithm, Algorithm::LeastTime);
    assert_eq!(route.selection.max_choose_tries, 2);
    assert!(config.observability.metrics.enabled);
}

#[tokio::test]
async fn test_missing_file_is_configuration_error() {
    let error = BalancerConfig::load_from_file("/nonexistent/balancer.yaml")
        .await
        .unwrap_err();
    assert!(error.is_configuration());
}

#[test]
fn test_unknown_algorithm_is_rejected() {
    let yaml = r#"
routes:
  - id: users
    service_id: user-service
    selection:
      algorithm: P2C
"#;
    let error = BalancerConfig::from_yaml_str(yaml).unwrap_err();
    assert!(error.to_string().contains("P2C"));
}

#[test]
fn test_validation_reports_every_problem() {
    let yaml = r#"
routes:
  - id: users
    service_id: user-service
    selection:
      max_choose_tries: 0
  - id: users
    service_id: ""
  - id: ""
    service_id: order-service
    selection:
      candidate_metadata_prefix: ""
"#;
    let error = BalancerConfig::from_yaml_str(yaml).unwrap_err();
    let message = match &error {
        GatewayError::Configuration { message } => message.clone(),
        other => panic!("unexpected error: {:?}", other),
    };

    assert!(message.contains("max_choose_tries"));
    assert!(message.contains("Duplicate route id"));
    assert!(message.contains("empty service_id"));
    assert!(message.contains("empty id"));
    assert!(message.contains("candidate_metadata_prefix"));
}

#[test]
fn test_loaded_routes_bind_to_coordinator() {
    let config = BalancerConfig::from_yaml_str(YAML_CONFIG).unwrap();
    let coordinator = SelectionCoordinator::new(
        Arc::new(StaticDiscovery::new()),
        Arc::new(PredicateRuleMatcher::new()),
        Arc::new(NoopMetrics),
        Arc::new(InstanceHealthRegistry::new()),
        Arc::new(ChooserRegistry::with_defaults()),
    );

    for route in &config.routes {
        let bound = coordinator.bind(route.selection.clone()).unwrap();
        assert_eq!(bound.algorithm(), route.selection.algorithm);
        assert_eq!(bound.chooser_name(), route.selection.algorithm.name());
    }
}

#[test]
fn test_config_serializes_algorithm_keys() {
    let config = BalancerConfig::from_yaml_str(YAML_CONFIG).unwrap();
    let yaml = serde_yaml::to_string(&config).unwrap();

    assert!(yaml.contains("algorithm: WLC"));
    assert!(yaml.contains("algorithm: SH"));

    let reparsed = BalancerConfig::from_yaml_str(&yaml).unwrap();
    assert_eq!(reparsed.routes, config.routes);
}
