//! Error types for the Prometheus operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed label selector on a custom resource
    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    /// A rule document failed validation
    #[error("Rule validation failed: {0}")]
    RuleValidation(String),

    /// Building the desired state of an object failed
    #[error("synthesizing {kind} for {key} failed: {source}")]
    Synthesis {
        kind: &'static str,
        key: String,
        #[source]
        source: Box<OperatorError>,
    },

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Spec validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Wrap an error with the kind and key of the object being synthesized.
    pub fn synthesis(kind: &'static str, key: impl ToString, source: OperatorError) -> Self {
        OperatorError::Synthesis {
            kind,
            key: key.to_string(),
            source: Box::new(source),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::Timeout(_)
            | OperatorError::ReconcileFailed(_) => true,
            OperatorError::Synthesis { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True for a broken invariant, which points at a defect rather than cluster state.
    pub fn is_internal(&self) -> bool {
        match self {
            OperatorError::Internal(_) => true,
            OperatorError::Synthesis { source, .. } => source.is_internal(),
            _ => false,
        }
    }

    /// The API server's error status, if this error came from the API server.
    pub fn api_error(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            OperatorError::KubeError(kube::Error::Api(response)) => Some(response),
            OperatorError::Synthesis { source, .. } => source.api_error(),
            _ => None,
        }
    }

    /// An update rejected with `422 Invalid`, typically a change to an immutable field.
    pub fn is_invalid(&self) -> bool {
        self.api_error()
            .is_some_and(|e| e.code == 422 && e.reason == "Invalid")
    }

    /// The target object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            _ => self.api_error().is_some_and(|e| e.code == 404),
        }
    }

    /// An optimistic-concurrency conflict on write.
    pub fn is_conflict(&self) -> bool {
        self.api_error().is_some_and(|e| e.code == 409)
    }
}

impl From<validator::ValidationErrors> for OperatorError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        if messages.is_empty() {
            // Only nested errors
            return OperatorError::ValidationError(errors.to_string());
        }
        messages.sort();
        OperatorError::ValidationError(messages.join("; "))
    }
}

/// Build an API server error response, the way the API server reports failures.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "StatefulSet".to_string(),
            name: "thanos-ruler-main".to_string(),
            namespace: "monitoring".to_string(),
        };
        assert!(err.to_string().contains("StatefulSet"));
        assert!(err.to_string().contains("thanos-ruler-main"));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout_err = OperatorError::Timeout("test".to_string());
        assert!(timeout_err.is_retryable());

        let validation_err = OperatorError::ValidationError("test".to_string());
        assert!(!validation_err.is_retryable());

        let selector_err = OperatorError::InvalidSelector("bad".to_string());
        assert!(!selector_err.is_retryable());
    }

    #[test]
    fn test_synthesis_context() {
        let err = OperatorError::synthesis(
            "StatefulSet",
            "monitoring/main",
            OperatorError::InvalidConfig("no query endpoints".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "synthesizing StatefulSet for monitoring/main failed: Invalid configuration: no query endpoints"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_api_error_classification() {
        let invalid = api_error(422, "Invalid", "spec.selector: field is immutable");
        assert!(invalid.is_invalid());
        assert!(invalid.is_retryable());
        assert!(!invalid.is_not_found());

        let not_found = api_error(404, "NotFound", "statefulsets \"x\" not found");
        assert!(not_found.is_not_found());
        assert!(!not_found.is_invalid());

        let conflict = api_error(409, "Conflict", "the object has been modified");
        assert!(conflict.is_conflict());

        // 422 with another reason is not an immutable-field rejection
        let unprocessable = api_error(422, "Unprocessable", "other");
        assert!(!unprocessable.is_invalid());
    }

    #[test]
    fn test_internal_errors() {
        let err = OperatorError::synthesis(
            "ConfigMap",
            "ns/a",
            OperatorError::Internal("unmapped key".to_string()),
        );
        assert!(err.is_internal());
        assert!(!err.is_retryable());
    }
}
