//! # Remote Endpoint
//!
//! The abstract remote boundary: pull deltas since a cursor, push one
//! operation, nothing else. Any concrete backend (HTTP, gRPC, WebSocket)
//! lives behind this trait in the host; the specific wire format is
//! explicitly out of scope for the core.
//!
//! ## Contract
//! ```text
//! pull(cursor) → PullResponse { changes[], new_cursor }
//! push(op)     → PushResponse::Ack
//!              | PushResponse::Conflict(remote_version)
//! ```
//!
//! Errors are classified by the implementation:
//! - `SyncError::TransientTransport` / `SyncError::Timeout` → retried with
//!   backoff by the coordinator
//! - `SyncError::Fatal` → schema/version mismatch, session aborts with no
//!   cursor advancement

use async_trait::async_trait;

use caravan_core::types::{Operation, RemoteChange, VersionedChange};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Wire Types
// =============================================================================

/// Result of one delta pull.
#[derive(Debug, Clone)]
pub struct PullResponse {
    /// Remote changes since the supplied cursor.
    pub changes: Vec<RemoteChange>,

    /// Opaque token to hand back on the next pull. Advanced locally only
    /// after the batch is durably merged.
    pub new_cursor: String,
}

/// Result of pushing one operation.
#[derive(Debug, Clone)]
pub enum PushResponse {
    /// Remote accepted and durably recorded the operation.
    Ack,

    /// Remote holds a diverging version for the same entity key.
    Conflict { remote: VersionedChange },
}

// =============================================================================
// Endpoint Trait
// =============================================================================

/// The abstract remote system. Implementations must be cheap to clone
/// behind an `Arc` and safe to call concurrently.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Requests remote changes since `cursor` (`None` = from the beginning).
    async fn pull(&self, cursor: Option<&str>) -> SyncResult<PullResponse>;

    /// Transmits one operation. An `Ack` is the only thing that completes
    /// an operation.
    async fn push(&self, op: &Operation) -> SyncResult<PushResponse>;
}

// =============================================================================
// Scripted Remote (test double)
// =============================================================================

/// In-memory endpoint with scriptable behavior, used across the workspace
/// tests the way a hub is faked in transport tests.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    state: std::sync::Mutex<ScriptedState>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    /// Queued pull responses; when empty, pulls return no changes and echo
    /// the cursor back.
    pull_queue: std::collections::VecDeque<PullResponse>,

    /// id → remaining transient failures before a push succeeds.
    transient_failures: std::collections::HashMap<String, u32>,

    /// id → conflicting remote version returned on push.
    push_conflicts: std::collections::HashMap<String, VersionedChange>,

    /// Every operation the remote acked, in arrival order.
    acked: Vec<Operation>,

    /// Total push attempts observed (including failed ones).
    push_attempts: u32,

    /// When set, every pull fails fatally (schema mismatch simulation).
    fatal_pulls: bool,

    /// When set, every push fails transiently (sustained outage).
    outage: bool,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pull response.
    pub fn enqueue_pull(&self, changes: Vec<RemoteChange>, new_cursor: &str) {
        let mut state = self.state.lock().unwrap();
        state.pull_queue.push_back(PullResponse {
            changes,
            new_cursor: new_cursor.to_string(),
        });
    }

    /// The next `n` pushes of `id` fail transiently, then succeed.
    pub fn fail_push_times(&self, id: &str, n: u32) {
        self.state
            .lock()
            .unwrap()
            .transient_failures
            .insert(id.to_string(), n);
    }

    /// Pushing `id` returns a conflict with the given remote version.
    pub fn conflict_on_push(&self, id: &str, remote: VersionedChange) {
        self.state
            .lock()
            .unwrap()
            .push_conflicts
            .insert(id.to_string(), remote);
    }

    /// All pulls fail fatally from now on.
    pub fn set_fatal_pulls(&self, fatal: bool) {
        self.state.lock().unwrap().fatal_pulls = fatal;
    }

    /// All pushes fail transiently from now on (sustained outage).
    pub fn set_outage(&self, outage: bool) {
        self.state.lock().unwrap().outage = outage;
    }

    /// Operations acked so far, in arrival order.
    pub fn acked(&self) -> Vec<Operation> {
        self.state.lock().unwrap().acked.clone()
    }

    /// Total push attempts observed.
    pub fn push_attempts(&self) -> u32 {
        self.state.lock().unwrap().push_attempts
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedRemote {
    async fn pull(&self, cursor: Option<&str>) -> SyncResult<PullResponse> {
        let mut state = self.state.lock().unwrap();

        if state.fatal_pulls {
            return Err(SyncError::Fatal("schema version mismatch".into()));
        }

        Ok(state.pull_queue.pop_front().unwrap_or_else(|| PullResponse {
            changes: Vec::new(),
            new_cursor: cursor.unwrap_or("cursor-0").to_string(),
        }))
    }

    async fn push(&self, op: &Operation) -> SyncResult<PushResponse> {
        let mut state = self.state.lock().unwrap();
        state.push_attempts += 1;

        if state.outage {
            return Err(SyncError::TransientTransport("connection refused".into()));
        }

        if let Some(remaining) = state.transient_failures.get_mut(&op.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::TransientTransport("connection reset".into()));
            }
        }

        if let Some(remote) = state.push_conflicts.remove(&op.id) {
            return Ok(PushResponse::Conflict { remote });
        }

        state.acked.push(op.clone());
        Ok(PushResponse::Ack)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
