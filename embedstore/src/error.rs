//! Error types for embedstore.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EmbedStoreError>;

/// Errors produced by the store, the similarity search, the driver and the
/// external providers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmbedStoreError {
    /// A vector's length disagrees with the store's established dimension.
    #[error("dimension mismatch{}: expected {expected}, got {actual}", .id.map(|id| format!(" for id {id}")).unwrap_or_default())]
    DimensionMismatch {
        /// Record the vector belongs to, when known.
        id: Option<i64>,
        /// Established dimension.
        expected: usize,
        /// Offending length.
        actual: usize,
    },

    /// A zero-length vector was offered for storage.
    #[error("empty vector for id {0}")]
    EmptyVector(i64),

    /// The requested record is absent or has no vector.
    #[error("record {0} not found or not embedded")]
    NotFound(i64),

    /// A similarity query ran against a store without embedded records.
    #[error("store has no embedded records")]
    EmptyStore,

    /// The backing database cannot be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The embedding provider failed.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// The text-generation provider failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// A run finished with some ids left unembedded.
    #[error("{} record(s) failed to embed: {failed:?}", .failed.len())]
    PartialBatchFailure {
        /// Ids that were not embedded.
        failed: Vec<i64>,
    },

    /// A run stopped on a store error; `unembedded` lists every id it
    /// left without a vector that it could still name.
    #[error("run interrupted: {reason}; {} record(s) left unembedded", .unembedded.len())]
    Interrupted {
        /// The store error that stopped the run.
        reason: String,
        /// Failed and skipped ids.
        unembedded: Vec<i64>,
    },

    /// A stored blob is not a packed float32 array.
    #[error("corrupt vector for id {id}: {len} bytes is not a multiple of 4")]
    CorruptVector {
        /// Record id.
        id: i64,
        /// Blob length in bytes.
        len: usize,
    },

    /// A configured table or column name is not a plain SQL identifier.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Database error.
    #[error(transparent)]
    Sqlite(rusqlite::Error),

    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl EmbedStoreError {
    /// Whether a driver may retry the operation that produced this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for EmbedStoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::CannotOpen
                        | ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::NotADatabase
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::PermissionDenied
                ) =>
            {
                Self::StoreUnavailable(err.to_string())
            }
            _ => Self::Sqlite(err),
        }
    }
}

impl From<reqwest::Error> for EmbedStoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = EmbedStoreError::DimensionMismatch {
            id: Some(7),
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "dimension mismatch for id 7: expected 3, got 2"
        );

        let err = EmbedStoreError::DimensionMismatch {
            id: None,
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 3, got 2");
    }

    #[test]
    fn test_cannot_open_is_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        );
        assert!(matches!(
            EmbedStoreError::from(err),
            EmbedStoreError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(EmbedStoreError::Provider("quota".into()).is_retryable());
        assert!(!EmbedStoreError::EmptyStore.is_retryable());
        assert!(
            !EmbedStoreError::DimensionMismatch {
                id: None,
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
    }
}
