//! # caravan-sync: Orchestration for the Caravan Sync Core
//!
//! This crate turns the pure decisions of `caravan-core` and the durable
//! state of `caravan-store` into a running offline-first sync engine:
//! background sessions, policy-gated pushes, conflict adjudication, and a
//! host-facing event stream.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncAgent (Main Facade)                       │  │
//! │  │                                                                  │  │
//! │  │  enqueue / cancel / resolve_conflict / status / subscribe       │  │
//! │  │  report_network / report_battery / sync_now / shutdown          │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │SyncCoordinator │  │  Connectivity  │  │  EventBus              │    │
//! │  │                │  │  Monitor       │  │                        │    │
//! │  │ Pull deltas    │  │                │  │ queue.changed          │    │
//! │  │ Reconcile      │  │ Debounced      │  │ sync.started/completed │    │
//! │  │ Push (gated,   │  │ reconnect      │  │ conflict.*             │    │
//! │  │ tiered, retry, │  │ triggers,      │  │ corruption.detected    │    │
//! │  │ breaker)       │  │ degradation    │  │ operation.failed       │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  RemoteEndpoint (trait)                                          │  │
//! │  │  pull(cursor) / push(op) - the concrete wire format lives in    │  │
//! │  │  the host, never here                                            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `SyncAgent` facade and background session loop
//! - [`coordinator`] - `SyncCoordinator` session state machine
//! - [`monitor`] - Connectivity transitions, debounce, degradation
//! - [`remote`] - Abstract remote endpoint trait + scripted test double
//! - [`session`] - Session phases, reports, cancellation tokens
//! - [`events`] - Host-facing broadcast event stream
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Sync error taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use caravan_sync::{SyncAgentBuilder, SyncConfig, EnqueueRequest};
//! use caravan_store::{Store, StoreConfig};
//! use caravan_core::Priority;
//!
//! let store = Store::new(StoreConfig::new("./caravan.db")).await?;
//! let mut agent = SyncAgentBuilder::new(SyncConfig::load_or_default(None))
//!     .with_store(store)
//!     .with_remote(remote)
//!     .build()
//!     .await?;
//! agent.start().await?;
//!
//! let id = agent.enqueue(EnqueueRequest::new(
//!     "update-progress", "progress/user-1", Priority::High, payload,
//! )).await?;
//!
//! let mut events = agent.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod monitor;
pub mod remote;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, EnqueueRequest, SyncAgent, SyncAgentBuilder};
pub use config::{CacheSettings, DeviceConfig, SyncConfig, SyncSettings};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use monitor::{
    degrade, ConnectivityMonitor, MonitorConfig, MonitorHandle, SyncAggressiveness, SyncTrigger,
};
pub use remote::{PullResponse, PushResponse, RemoteEndpoint, ScriptedRemote};
pub use session::{CancelHandle, CancelToken, SessionPhase, SessionReport, SyncOutcome};
