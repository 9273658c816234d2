//! # Store Error Types
//!
//! Error types for the durability layer.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (caravan-sync) ← Session-level handling                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Status events ← Host presents a meaningful message                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Durability layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A malformed operation was rejected at the enqueue boundary.
    /// Nothing was journaled.
    #[error("Validation error: {0}")]
    Validation(#[from] caravan_core::ValidationError),

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Journal or checkpoint record could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A cache entry failed checksum validation and was quarantined.
    /// The corrupted bytes are never returned to the caller.
    #[error("Corruption detected for cache entry '{key}'")]
    CorruptionDetected { key: String },

    /// A sealed cache entry could not be decrypted. Treated identically to
    /// checksum failure: the entry is quarantined.
    #[error("Decryption failed for cache entry '{key}'")]
    DecryptFailed { key: String },

    /// Passphrase-based key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption of a cache value failed.
    #[error("Seal failed: {0}")]
    SealFailed(String),

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal store error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Creates a NotFound error for a given entity type and id.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

/// Convert sqlx errors to StoreError.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut => StoreError::PoolExhausted,
            sqlx::Error::PoolClosed => {
                StoreError::ConnectionFailed("Pool is closed".to_string())
            }
            sqlx::Error::Database(db_err) => StoreError::QueryFailed(db_err.message().to_string()),
            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
