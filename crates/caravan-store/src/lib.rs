//! # caravan-store: Durability Layer for the Caravan Sync Core
//!
//! This crate owns every byte that must survive a process restart or a
//! network outage: the operation journal with its checkpoints, the encrypted
//! cache segments, the conflict audit trail, and the delta cursor.
//!
//! ## Persistence Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SQLite file (WAL mode)                               │
//! │                                                                         │
//! │  op_journal        Append-only write-ahead journal. Every mutation     │
//! │                    is committed here BEFORE it becomes visible.        │
//! │  op_checkpoints    Periodic snapshots for fast restart.                │
//! │  cache_entries     Key/value segments, per-entry SHA-256 checksums,    │
//! │                    optional XChaCha20-Poly1305 sealing.                │
//! │  cache_quarantine  Corrupted entries, readable-set removed,            │
//! │                    retained for diagnostics.                           │
//! │  conflict_audit    Append-only resolver audit trail.                   │
//! │  sync_state        Cursor from the last durably merged pull.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pool`] - Store handle, pool configuration, migrations entry point
//! - [`oplog`] - Operation Log (journal + checkpoints + priority dequeue)
//! - [`cache`] - Cache Store (TTL, checksum quarantine, tiered eviction)
//! - [`audit`] - Conflict audit repository
//! - [`crypto`] - Sealed blobs and key derivation
//! - [`error`] - Store error types
//!
//! ## Concurrency
//! Single-writer discipline per store: every mutation serializes through
//! one async write lock; reads take the read half against a stable
//! snapshot. SQLite WAL mode keeps readers and writers from blocking each
//! other underneath.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod cache;
pub mod crypto;
pub mod error;
pub mod migrations;
pub mod oplog;
pub mod pool;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::ConflictAuditLog;
pub use cache::{CacheConfig, CacheStore, CompactReport, SetOptions, StoreEvent};
pub use crypto::CacheCipher;
pub use error::{StoreError, StoreResult};
pub use oplog::OperationLog;
pub use pool::{Store, StoreConfig};
