//! # Chooser Algorithms
//!
//! Pluggable instance-selection strategies. Every chooser receives the candidate pool
//! (already restricted to the canary-matched or fallback set) and narrows it to the
//! instances the registry currently considers reachable.
//!
//! ## Retry Policy
//!
//! All choosers run their pick rule through [`choose_with_retry`]:
//!
//! 1. Up to `max_choose_tries` attempts
//! 2. Each attempt re-reads candidates ∩ known instances; an empty set aborts with
//!    `NoCandidateMatch` (not retryable)
//! 3. The pick rule runs on candidates ∩ reachable instances
//! 4. The picked instance is revalidated with `is_alive`; a stale pick costs one attempt
//! 5. Between failed attempts the task yields, or sleeps for `retry_backoff` if set
//! 6. Exhaustion reports `RetriesExhausted` and bumps the max-tries counter

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::SelectionConfig;
use crate::core::types::{RequestContext, ServiceInstance};
use crate::load_balancing::failure::SelectionFailure;
use crate::load_balancing::registry::{InstanceHealthRegistry, InstanceStatus};
use crate::observability::metrics::{MetricsSink, MAX_TRIES};

pub mod hash;
pub mod least_connections;
pub mod noop;
pub mod random;
pub mod round_robin;
pub mod weighted;

pub use hash::{DestinationHashChooser, SourceHashChooser};
pub use least_connections::LeastConnectionsChooser;
pub use noop::NoopChooser;
pub use random::RandomChooser;
pub use round_robin::RoundRobinChooser;
pub use weighted::{
    LeastTimeChooser, Weighted, WeightedLeastConnections, WeightedLeastTime, WeightedRandom,
    WeightedRoundRobin,
};

/// Outcome of a single `choose` call
pub type ChooseResult = Result<Arc<ServiceInstance>, SelectionFailure>;

/// Everything a chooser may read while selecting
pub struct ChooseContext<'a> {
    pub service_id: &'a str,
    pub config: &'a SelectionConfig,
    pub request: &'a RequestContext,
    pub registry: &'a InstanceHealthRegistry,
    pub metrics: &'a dyn MetricsSink,
}

/// Core trait for instance selection algorithms
#[async_trait]
pub trait Chooser: Send + Sync {
    /// Pick one instance out of `candidates`
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Keep the entries of `pool` that are also in `candidates`, in candidate order
///
/// Values come from `pool`, so the result carries the fresher snapshot.
pub(crate) fn intersect(
    candidates: &[InstanceStatus],
    pool: Vec<InstanceStatus>,
) -> Vec<InstanceStatus> {
    let mut by_id: HashMap<String, InstanceStatus> = pool
        .into_iter()
        .map(|status| (status.instance.id.clone(), status))
        .collect();

    candidates
        .iter()
        .filter_map(|candidate| by_id.remove(candidate.id()))
        .collect()
}

/// Stable 64-bit hash (first 8 bytes of SHA-256, big-endian)
pub(crate) fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

async fn backoff(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Shared bounded retry loop around a pick rule
///
/// `pick` receives the non-empty reachable pool and returns an index into it.
pub async fn choose_with_retry<F>(
    name: &'static str,
    candidates: &[InstanceStatus],
    ctx: &ChooseContext<'_>,
    mut pick: F,
) -> ChooseResult
where
    F: FnMut(&[InstanceStatus]) -> Option<usize> + Send,
{
    let max_tries = ctx.config.max_choose_tries.max(1);
    let policy = ctx.config.null_ping_to_reachable;
    let mut last_seen = 0;

    for attempt in 1..=max_tries {
        let available = intersect(candidates, ctx.registry.get_all_instances(ctx.service_id));
        if available.is_empty() {
            debug!(service = ctx.service_id, algorithm = name, "No available candidates");
            return Err(SelectionFailure::NoCandidateMatch {
                service: ctx.service_id.to_string(),
            });
        }
        last_seen = available.len();

        let reachable = intersect(
            &available,
            ctx.registry.get_reachable_instances(ctx.service_id, policy),
        );

        if !reachable.is_empty() {
            if let Some(chosen) = pick(&reachable).and_then(|index| reachable.get(index)) {
                if ctx.registry.is_alive(chosen.id(), policy) {
                    debug!(
                        service = ctx.service_id,
                        instance_id = %chosen.instance.id,
                        connections = chosen.connections,
                        algorithm = name,
                        attempt,
                        "Selected instance"
                    );
                    return Ok(chosen.instance.clone());
                }
                debug!(
                    service = ctx.service_id,
                    instance_id = %chosen.instance.id,
                    attempt,
                    "Picked instance is no longer alive"
                );
            }
        }

        if attempt < max_tries {
            backoff(ctx.config.retry_backoff).await;
        }
    }

    warn!(
        service = ctx.service_id,
        algorithm = name,
        attempts = max_tries,
        candidates = last_seen,
        "No live instance found within max choose tries"
    );
    ctx.metrics.increment_counter(
        MAX_TRIES,
        &[
            ("algorithm", ctx.config.algorithm.name().to_string()),
            ("service", ctx.service_id.to_string()),
        ],
        1,
    );

    Err(SelectionFailure::RetriesExhausted {
        service: ctx.service_id.to_string(),
        attempts: max_tries,
        candidates: last_seen,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;
    use crate::core::config::Algorithm;

    #[test]
    fn test_intersect_keeps_candidate_order() {
        let fixture = Fixture::new(Algorithm::RoundRobin);
        let candidates = fixture.healthy(&["c", "a", "b"]);
        let pool = fixture.registry.get_all_instances("svc");

        let ids: Vec<_> = intersect(&candidates[..2], pool)
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("10.0.0.1"), hash_key("10.0.0.1"));
        assert_ne!(hash_key("10.0.0.1"), hash_key("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_retry_bound_with_dead_candidates() {
        let mut fixture = Fixture::new(Algorithm::LeastConnections);
        fixture.config.max_choose_tries = 4;
        let candidates = fixture.healthy(&["a", "b"]);
        fixture.registry.mark_alive("a", false);
        fixture.registry.mark_alive("b", false);

        let mut picks = 0;
        let result = choose_with_retry("test", &candidates, &fixture.ctx(), |_| {
            picks += 1;
            Some(0)
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            SelectionFailure::RetriesExhausted {
                service: "svc".into(),
                attempts: 4,
                candidates: 2,
            }
        );
        assert_eq!(picks, 0);
        assert_eq!(fixture.metrics.counter(MAX_TRIES), 1);
    }

    #[tokio::test]
    async fn test_unknown_candidates_abort_immediately() {
        let fixture = Fixture::new(Algorithm::Random);
        let candidates = fixture.healthy(&["a"]);
        fixture.registry.evict("a");

        let result = choose_with_retry("test", &candidates, &fixture.ctx(), |_| Some(0)).await;
        assert!(matches!(result, Err(SelectionFailure::NoCandidateMatch { .. })));
        assert_eq!(fixture.metrics.counter(MAX_TRIES), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_pick_counts_as_attempt() {
        let mut fixture = Fixture::new(Algorithm::Random);
        fixture.config.max_choose_tries = 2;
        let candidates = fixture.healthy(&["a"]);

        let mut picks = 0;
        let result = choose_with_retry("test", &candidates, &fixture.ctx(), |_| {
            picks += 1;
            Some(7)
        })
        .await;

        assert!(matches!(result, Err(SelectionFailure::RetriesExhausted { attempts: 2, .. })));
        assert_eq!(picks, 2);
    }
}
