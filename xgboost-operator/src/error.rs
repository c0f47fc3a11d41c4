//! Error types for the XGBoostJob operator.

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// The store did not answer in time. The request may still take effect.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Invalid configuration or malformed key.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Job spec validation error.
    #[error("XGBoostJob validation failed: {0}")]
    ValidationError(String),

    /// Reconciliation error.
    #[error("Reconciliation failed for {kind}/{name}: {cause}")]
    ReconcileError {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Error cause.
        cause: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Build a [`OperatorError::NotFound`].
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Whether the error means the object is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether the error is a server-side or client-side timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::KubeError(kube::Error::Api(resp)) => {
                resp.code == 504 || resp.reason == "Timeout" || resp.reason == "ServerTimeout"
            }
            _ => false,
        }
    }

    /// Whether the error is an optimistic-concurrency conflict or an
    /// already-existing object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> OperatorError {
        OperatorError::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn classifies_not_found() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(OperatorError::not_found("Pod", "default", "p").is_not_found());
        assert!(!api_error(500, "InternalError").is_not_found());
    }

    #[test]
    fn classifies_timeout() {
        assert!(api_error(504, "").is_timeout());
        assert!(api_error(500, "ServerTimeout").is_timeout());
        assert!(OperatorError::Timeout("create pod".into()).is_timeout());
        assert!(!api_error(409, "AlreadyExists").is_timeout());
    }

    #[test]
    fn classifies_conflict() {
        assert!(api_error(409, "AlreadyExists").is_conflict());
        assert!(!OperatorError::InvalidConfig("x".into()).is_conflict());
    }
}
