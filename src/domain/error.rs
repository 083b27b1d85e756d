use thiserror::Error;

/// Failures surfaced to callers of the gateway operations.
///
/// Clone-able on purpose: a single upstream failure is shared verbatim with
/// every deduplicated waiter of the same in-flight fetch. Degraded cache
/// writes are deliberately not represented here — they are logged and
/// counted where they happen, and never abort the operation that triggered
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },
    #[error("listing `{id}` not found")]
    NotFound { id: String },
    #[error("cannot add property: maximum of {max} featured properties allowed")]
    CapacityExceeded { max: usize },
    #[error("inconsistent cache state: {message}")]
    InconsistentState { message: String },
}

impl GatewayError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn capacity_exceeded(max: usize) -> Self {
        Self::CapacityExceeded { max }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::InconsistentState {
            message: message.into(),
        }
    }
}
