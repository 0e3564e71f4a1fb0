/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum TrammelError {
    /// Redis error.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Invalid counter key.
    #[error("invalid counter key: {0}")]
    InvalidCounterKey(String),

    /// Invalid concurrency limit.
    #[error("invalid concurrency limit: {0}")]
    InvalidConcurrencyLimit(String),

    /// Invalid window specification.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Invalid check interval (explicit milliseconds or divisor).
    #[error("invalid check interval: {0}")]
    InvalidCheckInterval(String),

    /// Invalid Redis client connection count.
    #[error("invalid connection count: {0}")]
    InvalidConnectionCount(String),

    /// The store answered with something that is not a counter value.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// The task running a claim stopped before reporting its outcome, for example
    /// because the runtime shut down.
    #[error("claim interrupted before reporting its outcome")]
    ClaimInterrupted,
}

/// Failure of a throttled call.
///
/// Keeps the wrapped operation's own error apart from failures of the shared
/// counter store, so callers can tell "my work failed" from "admission failed".
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The store failed while the call was being admitted. The operation never ran.
    #[error("admission failed: {0}")]
    Store(#[source] TrammelError),

    /// The wrapped operation ran and failed.
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> CallError<E> {
    /// Returns `true` if the call failed in the store before the operation ran.
    pub fn is_store(&self) -> bool {
        matches!(self, CallError::Store(_))
    }

    /// Returns `true` if the wrapped operation itself failed.
    pub fn is_operation(&self) -> bool {
        matches!(self, CallError::Operation(_))
    }

    /// The operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            CallError::Operation(err) => Some(err),
            CallError::Store(_) => None,
        }
    }
}

impl<E> From<TrammelError> for CallError<E> {
    fn from(err: TrammelError) -> Self {
        CallError::Store(err)
    }
}
