use http::StatusCode;
use thiserror::Error;

use crate::core::error::GatewayError;

/// Reason a request could not be routed to an instance
///
/// These are expected routing outcomes, not faults: they end up as a
/// `503 Service Unavailable` at the pipeline boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionFailure {
    /// Discovery returned no instances for the service
    #[error("no instances registered for service '{service}'")]
    NoInstancesRegistered { service: String },

    /// No instance belongs to the matched canary pool (or nothing matched and fallback is off)
    #[error("no candidate instances for service '{service}'")]
    NoCandidateMatch { service: String },

    /// No live instance was found within the configured number of attempts
    #[error("no live instance of service '{service}' after {attempts} tries ({candidates} candidates)")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        candidates: usize,
    },

    /// The chosen instance does not form a valid forwarding URL
    #[error("instance '{instance_id}' of service '{service}' has an invalid address")]
    InvalidTarget { service: String, instance_id: String },
}

impl SelectionFailure {
    /// Stable reason code used in metric tags
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoInstancesRegistered { .. } => "no-instances",
            Self::NoCandidateMatch { .. } => "no-candidates",
            Self::RetriesExhausted { .. } => "retries-exhausted",
            Self::InvalidTarget { .. } => "invalid-target",
        }
    }

    /// Service the failure refers to
    pub fn service(&self) -> &str {
        match self {
            Self::NoInstancesRegistered { service }
            | Self::NoCandidateMatch { service }
            | Self::RetriesExhausted { service, .. }
            | Self::InvalidTarget { service, .. } => service,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

impl From<SelectionFailure> for GatewayError {
    fn from(failure: SelectionFailure) -> Self {
        GatewayError::service_unavailable(failure.service().to_string(), failure.to_string())
    }
}
