//! # Sync Sessions
//!
//! Session state machine, outcome reporting, and cancellation tokens.
//!
//! ## Session State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      One Sync Session                                   │
//! │                                                                         │
//! │  Idle ──► PullingDelta ──► Reconciling ──► PushingOperations           │
//! │                │                                  │                     │
//! │                │ fatal mismatch                   │                     │
//! │                ▼                                  ▼                     │
//! │             Fatal                     Completed | PartialFailure       │
//! │                                                                         │
//! │  Cancellation can land in any phase: in-flight operations revert to    │
//! │  Queued with the attempt counter incremented, outcome = Cancelled.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;

// =============================================================================
// Phases & Outcomes
// =============================================================================

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    PullingDelta,
    Reconciling,
    PushingOperations,
    Completed,
    PartialFailure,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::PullingDelta => write!(f, "pulling_delta"),
            SessionPhase::Reconciling => write!(f, "reconciling"),
            SessionPhase::PushingOperations => write!(f, "pushing_operations"),
            SessionPhase::Completed => write!(f, "completed"),
            SessionPhase::PartialFailure => write!(f, "partial_failure"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Everything selected was pulled, reconciled, and pushed.
    Completed,
    /// The session ran but some step failed or was suspended.
    PartialFailure,
    /// Schema/version mismatch with the remote; no cursor advancement.
    Fatal,
    /// The owning cancellation token fired mid-session.
    Cancelled,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::Completed => write!(f, "completed"),
            SyncOutcome::PartialFailure => write!(f, "partial_failure"),
            SyncOutcome::Fatal => write!(f, "fatal"),
            SyncOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Session Report
// =============================================================================

/// Counters and outcome for one completed session.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionReport {
    /// Session id (also carried on the sync.started/sync.completed events).
    pub session_id: String,

    pub outcome: SyncOutcome,

    /// Remote changes pulled and durably merged.
    pub pulled: usize,

    /// Conflicts constructed during reconciliation and push.
    pub conflicts_detected: usize,

    /// Conflicts the precedence rules decided automatically.
    pub conflicts_auto_resolved: usize,

    /// Operations parked `Conflicted` for manual resolution.
    pub manual_required: usize,

    /// Operations confirmed by the remote.
    pub pushed: usize,

    /// Operations that exhausted retries (terminal `Failed`).
    pub failed: usize,

    /// Operations deferred by the Policy Gate this session.
    pub deferred: usize,

    /// True when the circuit breaker suspended the push phase.
    pub push_suspended: bool,

    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub finished_at: DateTime<Utc>,
}

impl SessionReport {
    /// A fresh report for a session starting now.
    pub fn begin(session_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        SessionReport {
            session_id: session_id.into(),
            outcome: SyncOutcome::Completed,
            pulled: 0,
            conflicts_detected: 0,
            conflicts_auto_resolved: 0,
            manual_required: 0,
            pushed: 0,
            failed: 0,
            deferred: 0,
            push_suspended: false,
            started_at,
            finished_at: started_at,
        }
    }
}

// =============================================================================
// Cancellation Token
// =============================================================================

/// Cancels the owning session. Cloneable; cancelling is idempotent.
///
/// Callback-style teardown becomes an explicit token: every blocking remote
/// call races against it, so tearing down a session can never leave an
/// operation stuck `InFlight`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the token. Safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// The receiving half carried by a session and its workers.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a connected handle/token pair.
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that can never fire (for tests and fire-and-forget runs).
    /// Dropping the sender closes the channel without cancelling: the
    /// stored value stays `false`.
    pub fn never() -> CancelToken {
        let (_tx, rx) = watch::channel(false);
        CancelToken { rx }
    }

    /// True once the handle fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the handle fires (or the handle is dropped, in which
    /// case cancellation can never happen and this pends forever).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without firing: park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
