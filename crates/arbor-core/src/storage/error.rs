//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions.

use std::io;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while streaming a blob
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored bytes do not follow the expected format
    #[error("Corrupt data: {details}")]
    Corrupt { details: String },

    /// A transaction scope was committed twice
    #[error("Transaction already released")]
    AlreadyReleased,

    /// A reader or pooled resource was used after being closed
    #[error("Resource already closed: {what}")]
    Closed { what: &'static str },

    /// Field index outside the schema's local field range
    #[error("Field index {index} out of range (field count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    /// A referenced entity does not exist (or is tombstoned)
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A live entity with this uid already exists
    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    /// Moving an item under itself or one of its descendants
    #[error("Invalid move: {details}")]
    InvalidMove { details: String },

    /// The field is not in the item's schema or is shared and read-only
    #[error("Field '{name}' cannot be written: {reason}")]
    FieldNotWritable { name: String, reason: &'static str },

    /// A uid string or byte form could not be parsed
    #[error("Invalid uid: {0}")]
    InvalidUid(String),

    /// Two different contents produced the same checksum
    #[error("Checksum collision on row {rowid}")]
    ChecksumCollision { rowid: i64 },

    /// A wait was abandoned through its cancellation flag
    #[error("Operation cancelled")]
    Cancelled,

    /// Several failures collected during disposal
    #[error("{} errors during disposal: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<StoreError>),
}

impl StoreError {
    /// Shorthand for a corruption error
    pub fn corrupt(details: impl Into<String>) -> Self {
        StoreError::Corrupt {
            details: details.into(),
        }
    }

    /// Shorthand for a missing entity
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    /// Check if this error indicates corrupt stored data
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Corrupt { .. } | StoreError::ChecksumCollision { .. } => true,
            StoreError::Aggregate(errors) => errors.iter().any(StoreError::is_corruption),
            _ => false,
        }
    }

    /// Check if this error is a programming error rather than a runtime failure
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyReleased
                | StoreError::Closed { .. }
                | StoreError::IndexOutOfRange { .. }
                | StoreError::InvalidMove { .. }
                | StoreError::FieldNotWritable { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::Corrupt { .. } => {
                Some("The stored value could not be decoded. Rewrite the affected item's fields or restore from a sync peer.")
            }
            StoreError::ChecksumCollision { .. } => {
                Some("Two different contents hashed to the same checksum. Report this as a bug.")
            }
            StoreError::AlreadyExists { .. } => {
                Some("Use a fresh uid, or delete the existing entity before reusing its uid.")
            }
            StoreError::Database(_) => {
                Some("Check that the database file is writable and not locked by another process.")
            }
            _ => None,
        }
    }

    /// Fold a list of errors into one, or `None` if empty
    pub fn aggregate(mut errors: Vec<StoreError>) -> Option<StoreError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(StoreError::Aggregate(errors)),
        }
    }
}

fn join_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check if a SQLite error is a UNIQUE or PRIMARY KEY constraint violation
pub fn is_unique_violation(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_corrupt_classification() {
        let err = StoreError::corrupt("offset table decreasing");
        assert!(err.is_corruption());
        assert!(!err.is_misuse());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_misuse_classification() {
        assert!(StoreError::AlreadyReleased.is_misuse());
        assert!(StoreError::Closed { what: "reader" }.is_misuse());
        assert!(!StoreError::Cancelled.is_misuse());
    }

    #[test]
    fn test_aggregate() {
        assert!(StoreError::aggregate(Vec::new()).is_none());

        let single = StoreError::aggregate(vec![StoreError::Cancelled]).unwrap();
        assert!(matches!(single, StoreError::Cancelled));

        let many = StoreError::aggregate(vec![
            StoreError::Cancelled,
            StoreError::corrupt("bad header"),
        ])
        .unwrap();
        assert!(many.is_corruption());
        let msg = many.to_string();
        assert!(msg.starts_with("2 errors"));
        assert!(msg.contains("bad header"));
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT UNIQUE NOT NULL);")
            .unwrap();
        conn.execute("INSERT INTO t (name) VALUES ('a')", []).unwrap();

        let err = conn
            .execute("INSERT INTO t (name) VALUES ('a')", [])
            .unwrap_err();
        assert!(is_unique_violation(&err));

        let err = conn
            .execute("INSERT INTO t (name) VALUES (NULL)", [])
            .unwrap_err();
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::IndexOutOfRange { index: 7, count: 3 };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('3'));
    }
}
