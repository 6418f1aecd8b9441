use async_trait::async_trait;
use rand::Rng;

use super::{choose_with_retry, ChooseContext, ChooseResult, Chooser};
use crate::load_balancing::registry::InstanceStatus;

/// Uniform pick among the reachable candidates
#[derive(Debug, Default)]
pub struct RandomChooser;

impl RandomChooser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Chooser for RandomChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        choose_with_retry(self.name(), candidates, ctx, |reachable| {
            Some(rand::thread_rng().gen_range(0..reachable.len()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
