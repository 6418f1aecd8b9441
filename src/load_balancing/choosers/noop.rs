use async_trait::async_trait;
use tracing::warn;

use super::{ChooseContext, ChooseResult, Chooser};
use crate::load_balancing::failure::SelectionFailure;
use crate::load_balancing::registry::InstanceStatus;

/// Fallback for algorithm keys without a registered chooser
///
/// Never selects anything, so a misconfigured route fails closed with a 503.
#[derive(Debug, Default)]
pub struct NoopChooser;

impl NoopChooser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Chooser for NoopChooser {
    async fn choose(&self, candidates: &[InstanceStatus], ctx: &ChooseContext<'_>) -> ChooseResult {
        warn!(
            service = ctx.service_id,
            algorithm = ctx.config.algorithm.key(),
            candidates = candidates.len(),
            "No chooser registered for algorithm"
        );
        Err(SelectionFailure::NoCandidateMatch {
            service: ctx.service_id.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Algorithm;
    use crate::load_balancing::choosers::test_support::Fixture;

    #[tokio::test]
    async fn test_noop_never_selects() {
        let fixture = Fixture::new(Algorithm::RoundRobin);
        let candidates = fixture.healthy(&["a"]);

        let result = NoopChooser::new().choose(&candidates, &fixture.ctx()).await;
        assert_eq!(
            result.unwrap_err(),
            SelectionFailure::NoCandidateMatch { service: "svc".into() }
        );
    }
}
