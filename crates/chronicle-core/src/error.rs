//! Error types for the Chronicle sync engine

use thiserror::Error;

/// Main error type for Chronicle operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Key derivation failed (empty secret or KDF failure)
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Decryption failed: wrong key, tampered data, or malformed input
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Required configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sync transport failure (network or HTTP)
    #[error("Sync transport error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transport {
        /// HTTP status code, if the server answered at all
        status: Option<u16>,
        /// Human-readable failure description
        message: String,
    },

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Peer connection or signaling failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Record was not found in the store
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Build a transport error from an HTTP status code
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        SyncError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Build a transport error with no HTTP status (connect/timeout failures)
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::Transport {
            status: None,
            message: message.into(),
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Configuration("client id not set".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: client id not set"
        );
    }

    #[test]
    fn test_transport_error_includes_status() {
        let err = SyncError::http_status(503, "service unavailable");
        let msg = format!("{}", err);
        assert!(msg.contains("503"));
        assert!(msg.contains("service unavailable"));
    }

    #[test]
    fn test_transport_error_without_status() {
        let err = SyncError::network("connection refused");
        let msg = format!("{}", err);
        assert!(!msg.contains("HTTP"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }
}
