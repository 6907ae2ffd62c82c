//! Swarm error types.

/// Result alias for swarm operations.
pub type SwarmResult<T> = Result<T, SwarmError>;

/// Errors from swarm operations.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// The endpoint has been destroyed.
    #[error("swarm endpoint destroyed")]
    Destroyed,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}
