use async_trait::async_trait;

use super::{choose_with_retry, ChooseContext, ChooseResult, Chooser};
use crate::load_balancing::registry::InstanceStatus;

/// Pick the instance with the fewest active connections
///
/// Ties go to the first instance in candidate order.
#[derive(Debug, Default)]
pub struct LeastConnectionsChooser;

impl LeastConnectionsChooser {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn least_loaded(reachable: &[InstanceStatus]) -> Option<usize> {
    reachable
        .iter()
        .enumerate()
        .min_by_key(|(_, status)| status.connections)
        .map(|(index, _)| index)
}

#[async_trait]
impl Chooser for LeastConnectionsChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        choose_with_retry(self.name(), candidates, ctx, least_loaded).await
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
