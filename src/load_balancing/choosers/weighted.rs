//! # Weighted Variants
//!
//! `WR`, `WRR`, `WLC`, `WLT` and `LT` are registered as their own strategies, but their
//! pick rule is currently the one of the base chooser they wrap. The per-instance weight
//! input is already defined: the integer stored under `weight_metadata_key` in instance
//! metadata (see [`ServiceInstance::weight`]). A weighting formula plugs in at
//! [`Weighted::weights`] without touching the registry or the retry loop.
//!
//! [`ServiceInstance::weight`]: crate::core::types::ServiceInstance::weight

use async_trait::async_trait;
use tracing::trace;

use super::{
    ChooseContext, ChooseResult, Chooser, LeastConnectionsChooser, RandomChooser, RoundRobinChooser,
};
use crate::core::config::Algorithm;
use crate::load_balancing::registry::InstanceStatus;

/// Least time has no latency input yet and ranks by active connections
#[derive(Debug, Default)]
pub struct LeastTimeChooser {
    inner: LeastConnectionsChooser,
}

impl LeastTimeChooser {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Chooser for LeastTimeChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        self.inner.choose(candidates, ctx).await
    }

    fn name(&self) -> &'static str {
        Algorithm::LeastTime.name()
    }
}

/// Weighted strategy layered on an unweighted base chooser
#[derive(Debug)]
pub struct Weighted<C> {
    base: C,
    algorithm: Algorithm,
}

pub type WeightedRandom = Weighted<RandomChooser>;
pub type WeightedRoundRobin = Weighted<RoundRobinChooser>;
pub type WeightedLeastConnections = Weighted<LeastConnectionsChooser>;
pub type WeightedLeastTime = Weighted<LeastTimeChooser>;

impl<C: Chooser> Weighted<C> {
    pub fn new(algorithm: Algorithm, base: C) -> Self {
        Self { base, algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Weight of each candidate, in candidate order
    pub fn weights(candidates: &[InstanceStatus], key: &str) -> Vec<u32> {
        candidates
            .iter()
            .map(|status| status.instance.weight(key))
            .collect()
    }
}

impl WeightedRandom {
    pub fn random() -> Self {
        Self::new(Algorithm::WeightedRandom, RandomChooser::new())
    }
}

impl WeightedRoundRobin {
    pub fn round_robin() -> Self {
        Self::new(Algorithm::WeightedRoundRobin, RoundRobinChooser::new())
    }
}

impl WeightedLeastConnections {
    pub fn least_connections() -> Self {
        Self::new(Algorithm::WeightedLeastConnections, LeastConnectionsChooser::new())
    }
}

impl WeightedLeastTime {
    pub fn least_time() -> Self {
        Self::new(Algorithm::WeightedLeastTime, LeastTimeChooser::new())
    }
}

#[async_trait]
impl<C: Chooser> Chooser for Weighted<C> {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        trace!(
            algorithm = self.algorithm.key(),
            weights = ?Self::weights(candidates, &ctx.config.weight_metadata_key),
            "Weights not applied, delegating to base chooser"
        );
        self.base.choose(candidates, ctx).await
    }

    fn name(&self) -> &'static str {
        self.algorithm.name()
    }
}
