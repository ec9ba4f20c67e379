use std::fmt;

use crate::types::ReceiptHandle;

/// Errors surfaced by the dispatcher and its storage contract.
///
/// The dequeue path never returns these; it degrades to "nothing available".
/// Enqueue, acknowledgement, and visibility updates propagate them so callers
/// can retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Receipt handle unknown or stale.
    /// The delivery it authorized has been deleted or superseded.
    HandleNotFound {
        handle: ReceiptHandle,
    },

    /// The storage adapter failed.
    Storage {
        message: String,
    },

    /// The rate limiter failed to answer an admission query.
    RateLimiter {
        message: String,
    },

    /// Dispatcher has been stopped.
    Shutdown,
}

impl DispatchError {
    /// Convenience constructor for storage adapter failures.
    pub fn storage(message: impl Into<String>) -> Self {
        DispatchError::Storage {
            message: message.into(),
        }
    }

    /// Convenience constructor for rate-limiter failures.
    pub fn rate_limiter(message: impl Into<String>) -> Self {
        DispatchError::RateLimiter {
            message: message.into(),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::HandleNotFound { handle } =>
                write!(f, "receipt handle not found: {}", handle.0),
            DispatchError::Storage { message } =>
                write!(f, "storage error: {}", message),
            DispatchError::RateLimiter { message } =>
                write!(f, "rate limiter error: {}", message),
            DispatchError::Shutdown =>
                write!(f, "dispatcher is stopped"),
        }
    }
}

impl std::error::Error for DispatchError {}
