//! # Chooser Registry
//!
//! Maps algorithm keys to chooser instances. The registry is assembled at startup and
//! consulted when a route is bound, so every error it returns is a configuration error
//! that aborts route setup rather than an individual request.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use gateway_balancer::core::config::Algorithm;
//! use gateway_balancer::load_balancing::{ChooserRegistry, NoopChooser};
//! use std::sync::Arc;
//!
//! let registry = ChooserRegistry::with_defaults().with_fallback(Arc::new(NoopChooser::new()));
//! let chooser = registry.resolve(Algorithm::LeastConnections)?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::Algorithm;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::choosers::{
    Chooser, DestinationHashChooser, LeastConnectionsChooser, LeastTimeChooser, RandomChooser,
    RoundRobinChooser, SourceHashChooser, WeightedLeastConnections, WeightedLeastTime,
    WeightedRandom, WeightedRoundRobin,
};

/// Strategy dispatch by algorithm key
#[derive(Default)]
pub struct ChooserRegistry {
    choosers: HashMap<Algorithm, Arc<dyn Chooser>>,
    fallback: Option<Arc<dyn Chooser>>,
}

impl ChooserRegistry {
    /// Create an empty registry without a fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a chooser for every algorithm key
    pub fn with_defaults() -> Self {
        let mut choosers: HashMap<Algorithm, Arc<dyn Chooser>> = HashMap::new();

        choosers.insert(Algorithm::Random, Arc::new(RandomChooser::new()));
        choosers.insert(Algorithm::RoundRobin, Arc::new(RoundRobinChooser::new()));
        choosers.insert(Algorithm::WeightedRandom, Arc::new(WeightedRandom::random()));
        choosers.insert(Algorithm::WeightedRoundRobin, Arc::new(WeightedRoundRobin::round_robin()));
        choosers.insert(Algorithm::DestinationHash, Arc::new(DestinationHashChooser::new()));
        choosers.insert(Algorithm::SourceHash, Arc::new(SourceHashChooser::new()));
        choosers.insert(Algorithm::LeastConnections, Arc::new(LeastConnectionsChooser::new()));
        choosers.insert(Algorithm::LeastTime, Arc::new(LeastTimeChooser::new()));
        choosers.insert(
            Algorithm::WeightedLeastConnections,
            Arc::new(WeightedLeastConnections::least_connections()),
        );
        choosers.insert(Algorithm::WeightedLeastTime, Arc::new(WeightedLeastTime::least_time()));

        Self {
            choosers,
            fallback: None,
        }
    }

    /// Chooser returned for keys that have no registration
    pub fn with_fallback(mut self, chooser: Arc<dyn Chooser>) -> Self {
        self.fallback = Some(chooser);
        self
    }

    /// Register a chooser under `key`
    ///
    /// A key can only be registered once.
    pub fn register(&mut self, key: Algorithm, chooser: Arc<dyn Chooser>) -> GatewayResult<()> {
        if self.choosers.contains_key(&key) {
            return Err(GatewayError::DuplicateAlgorithm {
                algorithm: key.key().to_string(),
            });
        }

        debug!(algorithm = key.key(), chooser = chooser.name(), "Registered chooser");
        self.choosers.insert(key, chooser);
        Ok(())
    }

    /// Chooser for `key`, or the fallback if one is configured
    pub fn resolve(&self, key: Algorithm) -> GatewayResult<Arc<dyn Chooser>> {
        if let Some(chooser) = self.choosers.get(&key) {
            return Ok(chooser.clone());
        }

        match &self.fallback {
            Some(fallback) => {
                debug!(algorithm = key.key(), "Algorithm not registered, using fallback chooser");
                Ok(fallback.clone())
            }
            None => Err(GatewayError::UnknownAlgorithm {
                algorithm: key.key().to_string(),
            }),
        }
    }

    /// Registered keys, in declaration order
    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut keys: Vec<_> = self.choosers.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl std::fmt::Debug for ChooserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChooserRegistry")
            .field("algorithms", &self.algorithms())
            .field("fallback", &self.fallback.as_ref().map(|chooser| chooser.name()))
            .finish()
    }
}
