//! # Error Handling Module
//!
//! This module provides error handling for the balancer using the `thiserror` crate.
//! `GatewayError` covers configuration, collaborator and internal failures. Routing
//! failures a request can legitimately run into (no instances, no canary match,
//! retries exhausted) are modelled separately by
//! [`SelectionFailure`](crate::load_balancing::SelectionFailure) and converted into
//! `GatewayError::ServiceUnavailable` at the pipeline boundary.
//!
//! ## Rust Error Handling Concepts
//!
//! - `Result<T, E>` instead of exceptions; `?` propagates errors to the caller
//! - Each enum variant is one error condition, matched exhaustively
//! - `thiserror` derives `Display` and `Error` from the `#[error("...")]` attributes

use http::StatusCode;
use thiserror::Error;

/// Main result type used throughout the balancer
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the balancer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A chooser was registered twice for the same algorithm key
    #[error("Duplicate load balancing algorithm registered: {algorithm}")]
    DuplicateAlgorithm { algorithm: String },

    /// No chooser is registered for the key and no fallback is configured
    #[error("No such load balancing operator: {algorithm}")]
    UnknownAlgorithm { algorithm: String },

    /// Service discovery errors (service not found, discovery backend unavailable, etc.)
    #[error("Service discovery error: {message}")]
    ServiceDiscovery { message: String },

    /// No backend instance could be selected for the service
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a service discovery error with a custom message
    pub fn service_discovery<S: Into<String>>(message: S) -> Self {
        Self::ServiceDiscovery {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code the surrounding pipeline should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceDiscovery { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::DuplicateAlgorithm { .. }
            | Self::UnknownAlgorithm { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that must abort route configuration rather than a single request
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::DuplicateAlgorithm { .. }
                | Self::UnknownAlgorithm { .. }
        )
    }

    /// Get a string representation of the error type for logs and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::DuplicateAlgorithm { .. } => "duplicate_algorithm",
            Self::UnknownAlgorithm { .. } => "unknown_algorithm",
            Self::ServiceDiscovery { .. } => "service_discovery_error",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::service_unavailable("api", "no-instances").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::config("bad").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::service_discovery("down").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_configuration_errors() {
        assert!(GatewayError::DuplicateAlgorithm { algorithm: "RR".into() }.is_configuration());
        assert!(GatewayError::UnknownAlgorithm { algorithm: "XX".into() }.is_configuration());
        assert!(!GatewayError::service_unavailable("api", "down").is_configuration());
    }

    #[test]
    fn test_error_types() {
        assert_eq!(GatewayError::config("bad").error_type(), "configuration_error");
        assert_eq!(
            GatewayError::config("max_choose_tries must be >= 1").to_string(),
            "Configuration error: max_choose_tries must be >= 1"
        );
        assert_eq!(GatewayError::internal("boom").error_type(), "internal_error");
    }
}
