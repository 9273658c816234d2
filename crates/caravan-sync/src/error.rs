//! # Sync Error Types
//!
//! Error types for session orchestration.
//!
//! ## Error Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Submission    │  │   Transport     │  │     Session             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Validation     │  │  Transient      │  │  Fatal (schema/version) │ │
//! │  │  Store          │  │  Timeout        │  │  Cancelled              │ │
//! │  │                 │  │                 │  │  CircuitOpen            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  NOT errors:                                                            │
//! │  • Policy deferral - a scheduling outcome (operation stays Queued)     │
//! │  • ManualRequired  - a resolver outcome (operation parks Conflicted)   │
//! │                                                                         │
//! │  Local enqueue/cache operations never fail due to network state;      │
//! │  only transmission and conflict steps produce externally visible      │
//! │  failures.                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all session-level failures.
///
/// ## Design Principles
/// - Each variant includes enough context for the event stream (kind, id,
///   reason) so the host can present a meaningful message
/// - Errors are categorized for retry handling via [`SyncError::is_retryable`]
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// A malformed operation was rejected at the enqueue boundary.
    #[error("Validation error: {0}")]
    Validation(#[from] caravan_core::ValidationError),

    /// The durability layer failed.
    #[error("Store error: {0}")]
    Store(#[from] caravan_store::StoreError),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Transient transport failure - retried with exponential backoff.
    #[error("Transient transport failure: {0}")]
    TransientTransport(String),

    /// A remote call exceeded its timeout.
    #[error("Remote call timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Schema/version mismatch with the remote. The session aborts with no
    /// partial cursor advancement; retrying cannot help.
    #[error("Fatal remote mismatch: {0}")]
    Fatal(String),

    /// The owning session was cancelled (e.g. host backgrounding).
    #[error("Session cancelled")]
    Cancelled,

    /// The circuit breaker is open; pushing is suspended for the cool-down.
    #[error("Circuit breaker open, pushing suspended")]
    CircuitOpen,

    /// A conflict requires manual resolution; the operation is parked.
    #[error("Operation {operation_id} requires manual conflict resolution")]
    ConflictRequiresManual { operation_id: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// An operation is not in a state that allows the requested call.
    #[error("Operation {id} is {state}, cannot {attempted}")]
    InvalidState {
        id: String,
        state: String,
        attempted: String,
    },

    /// The agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried with backoff.
    ///
    /// ## Retryable Errors
    /// - Transient transport failures (network blips)
    /// - Timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Fatal remote mismatches
    /// - Validation and configuration errors
    /// - Cancellation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientTransport(_) | SyncError::Timeout(_)
        )
    }

    /// Returns true for schema/version mismatches that abort the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
