//! # caravan-core: Pure Decision Logic for the Caravan Sync Core
//!
//! This crate is the **heart** of the offline-first synchronization engine.
//! It contains every decision the engine makes as pure functions with zero
//! I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Caravan Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   Host Application                              │   │
//! │  │    Screens ──► Navigation ──► Design tokens ──► i18n           │   │
//! │  │    (external collaborators: consume the event stream,          │   │
//! │  │     submit typed operation payloads)                            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ enqueue / events                      │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    caravan-sync (orchestration)                 │   │
//! │  │    SyncAgent, SyncCoordinator, ConnectivityMonitor              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ caravan-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  policy   │  │ resolver  │  │ validation│  │   │
//! │  │   │ Operation │  │PolicyGate │  │ Conflict  │  │   rules   │  │   │
//! │  │   │ Conflict  │  │ windows   │  │ Resolver  │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO CLOCK READS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 caravan-store (durability layer)                │   │
//! │  │        Journal, checkpoints, encrypted cache segments           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Operation, Conflict, CacheEntry, etc.)
//! - [`policy`] - Policy Gate: time-window/battery/network admission
//! - [`resolver`] - Conflict Resolver: fixed precedence ruleset
//! - [`validation`] - Enqueue-boundary validation
//! - [`integrity`] - SHA-256 checksum arithmetic
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: every decision is deterministic - same input,
//!    same output - which is what makes the conflict audit trail mean
//!    anything
//! 2. **Time is an input**: the current instant, battery level, and network
//!    class arrive in a context struct; this crate never reads a clock
//! 3. **Explicit Errors**: all errors are typed, never strings or panics

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod integrity;
pub mod policy;
pub mod resolver;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use caravan_core::Operation` instead of
// `use caravan_core::types::Operation`

pub use error::{CoreError, CoreResult, ValidationError};
pub use policy::{Admission, BlackoutWindow, DeferReason, PolicyConfig, PolicyContext, PolicyGate};
pub use resolver::{ConflictResolver, ResolutionDecision, ResolverRules};
pub use types::*;
