//! Log error types.

/// Result alias for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors from log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Operation requires the log to be opened first.
    #[error("log is not ready")]
    NotReady,

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// Append on a log without the secret key.
    #[error("log is not writable")]
    NotWritable,

    /// The provided secret key does not belong to the public key.
    #[error("secret key does not match public key")]
    KeyMismatch,

    /// Entry payload does not match the declared value encoding.
    #[error("entry is not valid {0}")]
    InvalidEncoding(&'static str),

    /// Entry payload exceeds the frame limit.
    #[error("entry of {size} bytes exceeds maximum of {max}")]
    EntryTooLarge { size: usize, max: usize },

    /// IO error from the storage backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<postcard::Error> for LogError {
    fn from(err: postcard::Error) -> Self {
        LogError::Codec(err.to_string())
    }
}
