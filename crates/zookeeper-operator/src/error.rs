//! Error types for the ZooKeeper Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Validation error (terminal, not retried)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A referenced object does not exist yet
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Failure talking to the remote ZooKeeper ensemble
    #[error("ZooKeeper ensemble error: {0}")]
    ZooKeeper(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable.
    ///
    /// `NotFound` is retryable because the missing object (Service,
    /// EndpointSlice, AuthenticationClass) may be created by a sibling
    /// reconciler on a later pass. Validation errors are terminal until
    /// the user changes the spec.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::NotFound(_)
                | OperatorError::ZooKeeper(_)
                | OperatorError::Timeout(_)
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(OperatorError::Timeout("connect".into()).is_retryable());
        assert!(OperatorError::NotFound("svc".into()).is_retryable());
        assert!(OperatorError::ZooKeeper("refused".into()).is_retryable());
        assert!(!OperatorError::ValidationError("bad chroot".into()).is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        assert!(OperatorError::ZooKeeper("down".into())
            .requeue_delay()
            .is_some());
        assert!(OperatorError::ValidationError("two auth classes".into())
            .requeue_delay()
            .is_none());
    }
}
