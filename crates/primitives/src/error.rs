//! Key material error types.

/// Result alias for key material operations.
pub type Result<T> = core::result::Result<T, KeyError>;

/// Errors from parsing or constructing key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Input was not valid hex.
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Input had the wrong number of bytes.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

impl KeyError {
    /// Build a length error from an expected size and the offending slice length.
    pub fn length(expected: usize, actual: usize) -> Self {
        Self::Length { expected, actual }
    }
}
