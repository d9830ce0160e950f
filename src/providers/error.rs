/// Task hub transport error with retry classification.
///
/// Transports return this to tell the worker loop whether the failed call is
/// worth repeating. The worker never retries a completion itself; it abandons
/// the pass and lets the task hub redeliver the work item.
///
/// **Retryable**: connection drops, timeouts, busy backends.
///
/// **Permanent**: stale execution ids, unknown instances, malformed payloads.
///
/// ```rust,no_run
/// use durabletask::providers::TransportError;
///
/// # fn example() -> Result<(), TransportError> {
/// return Err(TransportError::retryable("fetch_work_item", "connection reset"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct TransportError {
    /// Transport call that failed, e.g. `complete_work_item`
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Rendering used when a transport failure has to be recorded against an instance.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}
