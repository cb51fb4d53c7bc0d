//! Error types for the pipeline core.
//!
//! `PipelineError` is what public operations return. Per-item failures never surface
//! through it: the step executor records them on the work item and folds them into the
//! aggregate step status instead.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Admission timeout for {service}/{}: waited {waited:?}", .feature.as_deref().unwrap_or("*"))]
    AdmissionTimeout {
        service: String,
        feature: Option<String>,
        waited: Duration,
    },

    #[error("Step {step_id} was interrupted")]
    Interrupted { step_id: Uuid },

    #[error("Retry limit exceeded for {target}: {retry_count} >= {max_retries}")]
    RetryLimitExceeded {
        target: String,
        retry_count: i32,
        max_retries: i32,
    },

    #[error("Step {step_id} is {current}, expected {expected}")]
    InvalidStepState {
        step_id: Uuid,
        current: String,
        expected: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Dispatch error: {0}")]
    DispatchError(String),
}

impl PipelineError {
    /// Infrastructure failures the dispatch transport may redeliver with backoff.
    /// Everything else is a final answer for the current invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError(_) | Self::DispatchError(_))
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(error: config::ConfigError) -> Self {
        PipelineError::ConfigurationError(error.to_string())
    }
}

/// Failures reported by a provider call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// The remote service refused the job for capacity reasons; a fresh creation
    /// attempt later may succeed.
    #[error("Remote admission limited: {0}")]
    AdmissionLimited(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Operation not supported by provider {provider}: {operation}")]
    Unsupported { provider: String, operation: String },
}

impl ProviderError {
    pub fn is_admission_limited(&self) -> bool {
        matches!(self, Self::AdmissionLimited(_))
    }
}

/// Rejected state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} on {event}")]
pub struct StateTransitionError {
    pub from: String,
    pub event: String,
}

impl StateTransitionError {
    pub fn new(from: impl ToString, event: impl ToString) -> Self {
        Self {
            from: from.to_string(),
            event: event.to_string(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::DatabaseError("down".into()).is_retryable());
        assert!(PipelineError::DispatchError("queue full".into()).is_retryable());
        assert!(!PipelineError::validation("bad").is_retryable());
        assert!(!PipelineError::Interrupted {
            step_id: Uuid::nil()
        }
        .is_retryable());
    }

    #[test]
    fn test_admission_timeout_display() {
        let err = PipelineError::AdmissionTimeout {
            service: "runninghub".into(),
            feature: None,
            waited: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "Admission timeout for runninghub/*: waited 3s");
    }

    #[test]
    fn test_provider_error_wraps() {
        let err: PipelineError = ProviderError::AdmissionLimited("busy".into()).into();
        assert!(matches!(err, PipelineError::Provider(ref p) if p.is_admission_limited()));
    }
}
