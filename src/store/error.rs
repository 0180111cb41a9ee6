//! Error types for shared-store operations.

use thiserror::Error;

/// Errors that can occur while talking to the shared store.
///
/// None of these ever reach a client as a 5xx: the admission path converts
/// them into a fail-open fallback decision and the abuse sub-limiter into a
/// fail-closed denial. Causes are logged at the call site.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The circuit breaker rejected the call without attempting I/O.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The per-operation deadline fired.
    #[error("store operation `{op}` timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    /// Acquiring a pooled connection failed.
    #[error("connection pool error: {message}")]
    Pool { message: String },

    /// The store returned an error or the connection broke mid-operation.
    #[error("store error: {source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },

    /// The store answered, but not in the shape the operation expects.
    #[error("unexpected reply for `{op}`")]
    BadReply { op: &'static str },
}
