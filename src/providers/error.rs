use crate::ErrorDetails;

/// Storage fault with a retry classification. Retryable faults (busy
/// database, lost connection, lock contention) are worth re-attempting;
/// permanent ones (unknown lock token, constraint violation, corrupt row)
/// are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Provider operation that failed, e.g. `"ack_orchestration_item"`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
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

    /// Surface to orchestration state as an infrastructure failure.
    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::infrastructure(&self.operation, &self.message, self.retryable)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
