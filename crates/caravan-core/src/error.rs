//! # Error Types
//!
//! Domain-specific error types for caravan-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  caravan-core errors (this file)                                       │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Rejected at enqueue, never persisted           │
//! │                                                                         │
//! │  caravan-store errors (separate crate)                                 │
//! │  └── StoreError       - Journal/cache durability failures              │
//! │                                                                         │
//! │  caravan-sync errors (separate crate)                                  │
//! │  └── SyncError        - Transport, conflict, and session failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → StoreError → SyncError → Events   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (operation id, kind, key)
//! 3. Errors are enum variants, never String
//! 4. A deferral by the Policy Gate is NOT an error - it is a scheduling
//!    decision and is modeled as a value, not a variant here

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// These represent rule violations inside the decision logic. They should be
/// caught and translated to user-facing status events by the orchestrator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation references a dependency that does not exist in the log.
    #[error("Operation {id} depends on unknown operation {dependency}")]
    UnknownDependency { id: String, dependency: String },

    /// An operation id was expected in the log but is not present.
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// An operation is not in a state that allows the requested transition.
    ///
    /// ## When This Occurs
    /// - Cancelling an operation that is already `InFlight`
    /// - Acking an operation that was never dequeued
    /// - Re-resolving a conflict that was already archived
    #[error("Operation {id} is {current_state}, cannot {attempted}")]
    InvalidStateTransition {
        id: String,
        current_state: String,
        attempted: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised synchronously at `enqueue` time. A malformed operation never
/// reaches the journal.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., invalid id characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// An operation cannot depend on itself.
    #[error("Operation {id} cannot depend on itself")]
    SelfDependency { id: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidStateTransition {
            id: "op-1".to_string(),
            current_state: "InFlight".to_string(),
            attempted: "cancel".to_string(),
        };
        assert_eq!(err.to_string(), "Operation op-1 is InFlight, cannot cancel");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "kind".to_string(),
        };
        assert_eq!(err.to_string(), "kind is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::SelfDependency {
            id: "op-1".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
