//! # Metrics Collection
//!
//! The selection core reports through the [`MetricsSink`] trait so the metrics backend
//! stays an injected collaborator.
//!
//! ## Sinks
//! - [`RecorderSink`] forwards to the global `metrics` recorder (Prometheus in production)
//! - [`InMemoryMetrics`] keeps values in memory for tests and embedded use
//!
//! ## Usage Example
//! ```rust,ignore
//! let handle = install_prometheus_recorder(&MetricsConfig::default())?;
//! let sink: Arc<dyn MetricsSink> = Arc::new(RecorderSink);
//! sink.increment_counter(NO_INSTANCES, &[("service", "users".to_string())], 1);
//! ```

use dashmap::DashMap;
use metrics::Label;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::config::MetricsConfig;

/// Discovery returned no instances
pub const NO_INSTANCES: &str = "load_balancer_no_instances";
/// No canary rule matched and fallback is disabled
pub const NO_CANDIDATES: &str = "load_balancer_no_candidates";
/// A chooser gave up after `max_choose_tries`
pub const MAX_TRIES: &str = "load_balancer_max_tries";
/// Any failed selection, tagged with `reason`
pub const FAILED_SELECTIONS: &str = "load_balancer_failed_selections";
/// Successful selections
pub const SELECTIONS: &str = "load_balancer_selections";
/// Selection latency, tagged with `outcome`
pub const SELECTION_DURATION: &str = "load_balancer_selection_duration";
/// `disconnect` without a matching `connect`
pub const COUNTER_UNDERFLOW: &str = "load_balancer_counter_underflow";

/// Metric tags as key/value pairs
pub type Tags = [(&'static str, String)];

/// Metrics collaborator consumed by the selection core
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` by `n`
    fn increment_counter(&self, name: &'static str, tags: &Tags, n: u64);

    /// Record one observation of the timer `name`
    fn record_timer(&self, name: &'static str, tags: &Tags, duration: Duration);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _tags: &Tags, _n: u64) {}

    fn record_timer(&self, _name: &'static str, _tags: &Tags, _duration: Duration) {}
}

/// Sink backed by the `metrics` crate facade
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

fn labels(tags: &Tags) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for RecorderSink {
    fn increment_counter(&self, name: &'static str, tags: &Tags, n: u64) {
        metrics::counter!(name, labels(tags)).increment(n);
    }

    fn record_timer(&self, name: &'static str, tags: &Tags, duration: Duration) {
        metrics::histogram!(name, labels(tags)).record(duration.as_secs_f64());
    }
}

/// Install the Prometheus recorder as the global `metrics` recorder
///
/// With a `listen_address` the exporter serves its own scrape endpoint and no handle is
/// returned; otherwise the handle renders the exposition text on demand.
pub fn install_prometheus_recorder(
    config: &MetricsConfig,
) -> GatewayResult<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let mut builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(SELECTION_DURATION.to_string()),
            &config.latency_buckets,
        )
        .map_err(|e| GatewayError::config(format!("Invalid latency buckets: {}", e)))?;

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key.clone(), value.clone());
    }

    match config.listen_address {
        Some(addr) => {
            builder
                .with_http_listener(addr)
                .install()
                .map_err(|e| {
                    GatewayError::internal(format!("Failed to install metrics exporter: {}", e))
                })?;
            info!(%addr, "Prometheus exporter listening");
            Ok(None)
        }
        None => builder
            .install_recorder()
            .map(Some)
            .map_err(|e| {
                GatewayError::internal(format!("Failed to install metrics recorder: {}", e))
            }),
    }
}

type SeriesKey = (&'static str, BTreeMap<String, String>);

fn series_key(name: &'static str, tags: &Tags) -> SeriesKey {
    (
        name,
        tags.iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    )
}

fn tags_match(series: &BTreeMap<String, String>, wanted: &[(&str, &str)]) -> bool {
    wanted
        .iter()
        .all(|(key, value)| series.get(*key).map(String::as_str) == Some(*value))
}

/// In-memory sink keyed by metric name and tag set
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<SeriesKey, u64>,
    timers: DashMap<SeriesKey, Vec<Duration>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total of `name` across every tag set
    pub fn counter(&self, name: &str) -> u64 {
        self.counter_with(name, &[])
    }

    /// Total of `name` across tag sets containing all of `tags`
    pub fn counter_with(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().0 == name && tags_match(&entry.key().1, tags))
            .map(|entry| *entry.value())
            .sum()
    }

    /// Number of observations of the timer `name` matching `tags`
    pub fn timer_count(&self, name: &str, tags: &[(&str, &str)]) -> usize {
        self.timers
            .iter()
            .filter(|entry| entry.key().0 == name && tags_match(&entry.key().1, tags))
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Sum of the observations of the timer `name` matching `tags`
    pub fn timer_total(&self, name: &str, tags: &[(&str, &str)]) -> Duration {
        self.timers
            .iter()
            .filter(|entry| entry.key().0 == name && tags_match(&entry.key().1, tags))
            .flat_map(|entry| entry.value().clone())
            .sum()
    }

    pub fn clear(&self) {
        self.counters.clear();
        self.timers.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, tags: &Tags, n: u64) {
        *self.counters.entry(series_key(name, tags)).or_insert(0) += n;
    }

    fn record_timer(&self, name: &'static str, tags: &Tags, duration: Duration) {
        self.timers
            .entry(series_key(name, tags))
            .or_default()
            .push(duration);
    }
}
