//! Error types for rollout-state

use thiserror::Error;

/// Errors raised while opening or migrating a persistence backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Deployment directory could not be prepared
    #[error("Deployment directory unavailable at {path}: {reason}")]
    Directory { path: String, reason: String },
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage trait operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// A required record is absent
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A stored snapshot no longer matches its recorded digest
    #[error("digest mismatch for {kind} snapshot: expected {expected}, found {actual}")]
    DigestMismatch {
        kind: String,
        expected: String,
        actual: String,
    },

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Build the error the in-memory fakes return when write failures are injected.
    pub fn injected(op: &str) -> Self {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected failure during {op}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_mismatch_names_kind_and_both_digests() {
        let err = StorageError::DigestMismatch {
            kind: "rollback".to_string(),
            expected: "aaa".to_string(),
            actual: "bbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rollback"));
        assert!(msg.contains("aaa"));
        assert!(msg.contains("bbb"));
    }

    #[test]
    fn injected_failure_is_an_io_error() {
        let err = StorageError::injected("save_token");
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("save_token"));
    }
}
