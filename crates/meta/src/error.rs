//! Metadata store error types.

/// Result alias for metadata store operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors from metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Backend database error.
    #[error("database error: {0}")]
    Database(String),

    /// IO error from the backing file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::DatabaseError> for MetaError {
    fn from(err: redb::DatabaseError) -> Self {
        MetaError::Database(err.to_string())
    }
}

impl From<redb::TransactionError> for MetaError {
    fn from(err: redb::TransactionError) -> Self {
        MetaError::Database(err.to_string())
    }
}

impl From<redb::TableError> for MetaError {
    fn from(err: redb::TableError) -> Self {
        MetaError::Database(err.to_string())
    }
}

impl From<redb::StorageError> for MetaError {
    fn from(err: redb::StorageError) -> Self {
        MetaError::Database(err.to_string())
    }
}

impl From<redb::CommitError> for MetaError {
    fn from(err: redb::CommitError) -> Self {
        MetaError::Database(err.to_string())
    }
}
