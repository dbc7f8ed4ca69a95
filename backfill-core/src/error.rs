//! Error types for backfill operations

use thiserror::Error;

/// Failure reported by a remote fetcher.
///
/// Only a human-readable message is carried; transport, status and decode
/// failures are not distinguished at this layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Deserialization failed: {reason}")]
    Deserialization { reason: String },

    #[error("Corrupt store key: {reason}")]
    CorruptKey { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Failed to open store at {path}: {reason}")]
    Open { path: String, reason: String },
}

/// Validation errors for caller-supplied values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid collection key {key:?}: {reason}")]
    InvalidCollectionKey { key: String, reason: String },

    #[error("Position index {position} overflows collection {collection}")]
    PositionOverflow { collection: String, position: u64 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Background executor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Task executor has been shut down")]
    ShutDown,

    #[error("No tokio runtime available to run background tasks")]
    NoRuntime,
}

/// Master error type for all backfill errors.
#[derive(Debug, Clone, Error)]
pub enum BackfillError {
    /// Remote fetch failed. Displays the transport message verbatim so it can
    /// be surfaced unchanged through a load state.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Result type alias for backfill operations.
pub type BackfillResult<T> = Result<T, BackfillError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_displays_message_verbatim() {
        let err = BackfillError::from(FetchError::new("network down"));
        assert_eq!(err.to_string(), "network down");
    }

    #[test]
    fn test_storage_error_display_transaction_failed() {
        let err = StorageError::TransactionFailed {
            reason: "disk full".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Transaction failed"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "network_page_size".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("network_page_size"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_backfill_error_from_variants() {
        let storage = BackfillError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, BackfillError::Storage(_)));

        let validation = BackfillError::from(ValidationError::InvalidCollectionKey {
            key: String::new(),
            reason: "empty".to_string(),
        });
        assert!(matches!(validation, BackfillError::Validation(_)));

        let config = BackfillError::from(ConfigError::MissingRequired {
            field: "base_url".to_string(),
        });
        assert!(matches!(config, BackfillError::Config(_)));

        let executor = BackfillError::from(ExecutorError::ShutDown);
        assert!(matches!(executor, BackfillError::Executor(_)));
        assert!(executor.to_string().contains("shut down"));
    }
}
