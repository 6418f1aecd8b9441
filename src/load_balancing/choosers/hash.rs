//! # Hash Choosers
//!
//! Modulo hashing over the reachable set. A host keeps its instance only while the
//! reachable set keeps its size and order; this is not consistent hashing, so growing
//! or shrinking the pool remaps hosts.

use async_trait::async_trait;

use super::{choose_with_retry, hash_key, ChooseContext, ChooseResult, Chooser};
use crate::load_balancing::registry::InstanceStatus;

fn index_for(key: &str, len: usize) -> usize {
    (hash_key(key) % len as u64) as usize
}

/// Pins each client host to an instance
#[derive(Debug, Default)]
pub struct SourceHashChooser;

impl SourceHashChooser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Chooser for SourceHashChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        // Requests without a known origin share one bucket
        let key = ctx.request.source_host().unwrap_or_default();
        choose_with_retry(self.name(), candidates, ctx, |reachable| {
            Some(index_for(&key, reachable.len()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "source_hash"
    }
}

/// Pins each destination host to an instance
#[derive(Debug, Default)]
pub struct DestinationHashChooser;

impl DestinationHashChooser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Chooser for DestinationHashChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        let key = ctx.request.destination_host().unwrap_or_default();
        choose_with_retry(self.name(), candidates, ctx, |reachable| {
            Some(index_for(&key, reachable.len()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "destination_hash"
    }
}
