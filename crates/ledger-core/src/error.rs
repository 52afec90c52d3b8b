//! Error types for the ledger record store.
//!
//! The variants form the taxonomy surfaced to callers of the write path.
//! Driver errors are never exposed directly: `sqlx::Error` is classified into
//! one of the taxonomy variants on conversion.

use thiserror::Error;

/// Result type alias using ledger's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// PostgreSQL SQLSTATE codes the write path distinguishes.
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const STRING_DATA_RIGHT_TRUNCATION: &str = "22001";
}

/// Core error type for ledger operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Collection name is not a configured, writable entity type
    #[error("Invalid collection: {0}")]
    InvalidCollection(String),

    /// Payload failed validation (missing required field, malformed value)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// No row matched the requested id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transaction-level failure (pool exhausted, connection lost)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable short name of the variant, used as the `error_kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidCollection(_) => "invalid_collection",
            Error::ValidationFailed(_) => "validation_failed",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }

    /// Whether the error was caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCollection(_)
                | Error::ValidationFailed(_)
                | Error::NotFound(_)
                | Error::Conflict(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db_err) => {
                let detail = match db_err.constraint() {
                    Some(constraint) => format!("{} ({})", db_err.message(), constraint),
                    None => db_err.message().to_string(),
                };
                match db_err.code().as_deref() {
                    Some(sqlstate::UNIQUE_VIOLATION) => Error::Conflict(detail),
                    Some(sqlstate::NOT_NULL_VIOLATION)
                    | Some(sqlstate::CHECK_VIOLATION)
                    | Some(sqlstate::FOREIGN_KEY_VIOLATION)
                    | Some(sqlstate::INVALID_TEXT_REPRESENTATION)
                    | Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE)
                    | Some(sqlstate::STRING_DATA_RIGHT_TRUNCATION) => {
                        Error::ValidationFailed(detail)
                    }
                    _ => Error::Internal(e.to_string()),
                }
            }
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => Error::StorageUnavailable(e.to_string()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_collection() {
        let err = Error::InvalidCollection("users".to_string());
        assert_eq!(err.to_string(), "Invalid collection: users");
    }

    #[test]
    fn test_error_display_validation_failed() {
        let err = Error::ValidationFailed("name is required".to_string());
        assert_eq!(err.to_string(), "Validation failed: name is required");
    }

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("products/42".to_string());
        assert_eq!(err.to_string(), "Not found: products/42");
    }

    #[test]
    fn test_error_display_conflict() {
        let err = Error::Conflict("duplicate name".to_string());
        assert_eq!(err.to_string(), "Conflict: duplicate name");
    }

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error:"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_pool_timeout_is_storage_unavailable() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert_eq!(err.kind(), "storage_unavailable");
    }

    #[test]
    fn test_pool_closed_is_storage_unavailable() {
        let err: Error = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }

    #[test]
    fn test_row_not_found_is_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_unclassified_sqlx_error_is_internal() {
        let err: Error = sqlx::Error::ColumnNotFound("doc".to_string()).into();
        assert!(matches!(err, Error::Internal(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(Error::NotFound("x".into()).is_client_error());
        assert!(Error::Conflict("x".into()).is_client_error());
        assert!(Error::ValidationFailed("x".into()).is_client_error());
        assert!(Error::InvalidCollection("x".into()).is_client_error());
        assert!(!Error::StorageUnavailable("x".into()).is_client_error());
        assert!(!Error::Internal("x".into()).is_client_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
