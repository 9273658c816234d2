//! # Validation Module
//!
//! Synchronous validation applied at `enqueue` time.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Host application                                             │
//! │  ├── Basic format checks (empty, length)                               │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE (enqueue boundary)                               │
//! │  ├── A malformed operation fails synchronously with a                  │
//! │  │   ValidationError and NEVER reaches the journal                     │
//! │  └── Everything past this point is assumed well-formed                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── NOT NULL / PRIMARY KEY constraints                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::Operation;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of an operation id.
pub const MAX_ID_LEN: usize = 128;

/// Maximum length of a kind tag.
pub const MAX_KIND_LEN: usize = 64;

/// Maximum length of an entity key.
pub const MAX_ENTITY_KEY_LEN: usize = 256;

// =============================================================================
// Field Validators
// =============================================================================

/// Validates an operation id.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Only printable, non-whitespace characters
pub fn validate_id(id: &str) -> ValidationResult<()> {
    validate_token("id", id, MAX_ID_LEN)
}

/// Validates a kind tag (e.g. "update-progress").
pub fn validate_kind(kind: &str) -> ValidationResult<()> {
    validate_token("kind", kind, MAX_KIND_LEN)
}

/// Validates an entity key.
pub fn validate_entity_key(key: &str) -> ValidationResult<()> {
    validate_token("entity_key", key, MAX_ENTITY_KEY_LEN)
}

fn validate_token(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Operation Validator
// =============================================================================

/// Validates a whole operation before it may enter the log.
///
/// ## Example
/// ```rust
/// use caravan_core::types::{Operation, Priority};
/// use caravan_core::validation::validate_operation;
/// use chrono::Utc;
///
/// let op = Operation::new(
///     "op-1", "update-progress", "progress/user-1",
///     Priority::Medium, "{}", vec![], None, Utc::now(),
/// );
/// assert!(validate_operation(&op).is_ok());
/// ```
pub fn validate_operation(op: &Operation) -> ValidationResult<()> {
    validate_id(&op.id)?;
    validate_kind(&op.kind)?;
    validate_entity_key(&op.entity_key)?;

    for dep in &op.depends_on {
        validate_id(dep)?;
        if dep == &op.id {
            return Err(ValidationError::SelfDependency { id: op.id.clone() });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
