//! Error types for ctxpool

use thiserror::Error;

use crate::{ConnectionId, ContextId, ServiceId};

/// Diagnostics attached to a fatal acquisition failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionFailure {
    /// Service the caller tried to acquire
    pub service: ServiceId,
    /// Unit of work that asked for it
    pub context: ContextId,
    /// Number of candidates tried
    pub attempts: u32,
    /// One message per failed attempt, in order
    pub errors: Vec<String>,
    /// Connections the context held when the acquisition gave up
    pub context_borrowed: usize,
    /// Contexts holding connections when the acquisition gave up
    pub live_contexts: usize,
}

/// Core error type for pooling operations
#[derive(Error, Debug)]
pub enum PoolingError {
    #[error("Connection {connection} expired: age {age_secs}s >= lifetime {lifetime_secs}s")]
    Expired {
        connection: ConnectionId,
        age_secs: u64,
        lifetime_secs: u64,
    },

    #[error("Connection {connection} unhealthy: {reason}")]
    Unhealthy {
        connection: ConnectionId,
        reason: String,
    },

    #[error("No pool exists for service {0}")]
    PoolNotFound(ServiceId),

    #[error("No factory registered for service {0}")]
    ServiceNotFound(ServiceId),

    #[error(
        "Failed to acquire {} for context {} after {} attempts: [{}]",
        .0.service,
        .0.context,
        .0.attempts,
        .0.errors.join("; ")
    )]
    AcquisitionFailed(Box<AcquisitionFailure>),

    #[error("Pool {service} is empty (capacity {capacity})")]
    PoolExhausted { service: ServiceId, capacity: usize },

    #[error("Connection {connection} is not checked out of pool {service}")]
    UnknownConnection {
        service: ServiceId,
        connection: ConnectionId,
    },

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PoolingError {
    /// Whether the worker that hit this error should stop taking new units of work.
    ///
    /// Only exhausted acquisitions are fatal: the resource behind the service is
    /// considered unreliable for this worker and a supervisor should replace it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolingError::AcquisitionFailed(_))
    }

    /// Whether this is an expiry or failed probe, both of which are recovered locally.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            PoolingError::Expired { .. } | PoolingError::Unhealthy { .. }
        )
    }

    /// Diagnostics of a fatal acquisition failure, if this is one.
    pub fn acquisition_failure(&self) -> Option<&AcquisitionFailure> {
        match self {
            PoolingError::AcquisitionFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for pooling operations
pub type Result<T> = std::result::Result<T, PoolingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> PoolingError {
        PoolingError::AcquisitionFailed(Box::new(AcquisitionFailure {
            service: ServiceId::from("db.default"),
            context: ContextId::from("req-1"),
            attempts: 2,
            errors: vec!["first".into(), "second".into()],
            context_borrowed: 0,
            live_contexts: 1,
        }))
    }

    #[test]
    fn test_only_acquisition_failure_is_fatal() {
        assert!(failure().is_fatal());
        assert!(!PoolingError::PoolNotFound(ServiceId::from("x")).is_fatal());
        assert!(
            !PoolingError::Unhealthy {
                connection: ConnectionId::new(1),
                reason: "gone".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_acquisition_failure_message_lists_attempts() {
        let message = failure().to_string();
        assert!(message.contains("db.default"));
        assert!(message.contains("req-1"));
        assert!(message.contains("first; second"));
    }

    #[test]
    fn test_lifecycle_errors() {
        let expired = PoolingError::Expired {
            connection: ConnectionId::new(7),
            age_secs: 61,
            lifetime_secs: 60,
        };
        assert!(expired.is_lifecycle());
        assert!(expired.to_string().contains("61s >= lifetime 60s"));
        assert!(failure().acquisition_failure().is_some());
        assert!(expired.acquisition_failure().is_none());
    }
}
