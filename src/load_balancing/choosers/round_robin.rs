use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{choose_with_retry, ChooseContext, ChooseResult, Chooser};
use crate::load_balancing::registry::InstanceStatus;

/// Cyclic pick driven by a per-service cursor
///
/// The cursor advances once per pick, including picks that fail revalidation, and
/// counts modulo the current size of the reachable set.
#[derive(Debug, Default)]
pub struct RoundRobinChooser {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinChooser {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, service_id: &str, len: usize) -> usize {
        if let Some(cursor) = self.cursors.get(service_id) {
            return cursor.fetch_add(1, Ordering::Relaxed) % len;
        }

        self.cursors
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
            % len
    }
}

#[async_trait]
impl Chooser for RoundRobinChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        let service_id = ctx.service_id;
        choose_with_retry(self.name(), candidates, ctx, |reachable| {
            Some(self.next(service_id, reachable.len()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
