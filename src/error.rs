//! API-level error types.

use thiserror::Error;

/// Error returned by [`Fiber::join`](crate::fiber::Fiber::join) when the
/// fiber can no longer complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The fiber was dropped before producing an exit, typically because
    /// the executor driving it shut down.
    #[error("fiber was lost before completion (executor shut down?)")]
    Lost,
}
