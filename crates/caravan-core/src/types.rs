//! # Domain Types
//!
//! Core domain types used throughout the Caravan sync core.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   Operation     │   │   CacheEntry    │   │    Conflict     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (dedup key) │   │  key            │   │  operation_id   │       │
//! │  │  kind           │   │  priority       │   │  local version  │       │
//! │  │  entity_key     │   │  checksum       │   │  remote version │       │
//! │  │  priority       │   │  pinned         │   │  rule fired     │       │
//! │  │  state machine  │   │  expires_at     │   │  resolution     │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Priority     │   │ OperationState  │   │   Resolution    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Critical       │   │  Queued         │   │  KeepLocal      │       │
//! │  │  High           │   │  Admitted       │   │  KeepRemote     │       │
//! │  │  Medium         │   │  InFlight       │   │  Merged         │       │
//! │  │  Low            │   │  Completed      │   │  ManualRequired │       │
//! │  │  Background     │   │  Conflicted     │   └─────────────────┘       │
//! │  └─────────────────┘   │  Failed         │                              │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Pattern
//! Every Operation has:
//! - `id`: globally unique, caller-supplied or generated - the idempotent
//!   dedup key (processed at most once to completion)
//! - `entity_key`: the data key the change targets - the collision key for
//!   conflict detection against remote deltas

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Priority
// =============================================================================

/// Operation and cache-entry priority tiers.
///
/// ## Ordering
/// Total order: `Critical > High > Medium > Low > Background`.
/// `Critical` operations bypass every policy deferral, and `Critical` cache
/// entries are exempt from automatic eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl Priority {
    /// Numeric rank used for ordering and persistence. Higher = more urgent.
    #[inline]
    pub const fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
            Priority::Background => 0,
        }
    }

    /// Reconstructs a priority from its persisted rank.
    pub const fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            4 => Some(Priority::Critical),
            3 => Some(Priority::High),
            2 => Some(Priority::Medium),
            1 => Some(Priority::Low),
            0 => Some(Priority::Background),
            _ => None,
        }
    }

    /// All tiers in descending urgency, for tier-by-tier draining.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

// =============================================================================
// Operation State
// =============================================================================

/// Lifecycle state of an operation.
///
/// ## State Machine
/// ```text
/// Queued → Admitted → InFlight → Completed
///    ▲                   │    └─► Conflicted (manual resolution required)
///    └───────────────────┘    └─► Failed     (retries exhausted)
///      (cancellation reverts InFlight to Queued, attempts incremented)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting in the log (possibly deferred by policy via `scheduled_for`).
    Queued,
    /// Cleared by the Policy Gate, selected for the current session.
    Admitted,
    /// Transmission in progress.
    InFlight,
    /// Remote confirmed; removed from the live log.
    Completed,
    /// Parked: resolver returned manual-required.
    Conflicted,
    /// Terminal failure: retries exhausted or non-retryable error.
    Failed,
}

impl OperationState {
    /// Terminal states leave the live log (`Conflicted` stays - it awaits
    /// manual resolution).
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Queued => write!(f, "queued"),
            OperationState::Admitted => write!(f, "admitted"),
            OperationState::InFlight => write!(f, "in_flight"),
            OperationState::Completed => write!(f, "completed"),
            OperationState::Conflicted => write!(f, "conflicted"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// A unit of pending local work awaiting transmission and confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Operation {
    /// Globally unique id - the idempotent dedup key.
    pub id: String,

    /// String tag identifying the change type (e.g. "update-progress").
    pub kind: String,

    /// The data key this change targets; collision key for conflict
    /// detection against remote deltas.
    pub entity_key: String,

    /// Priority tier.
    pub priority: Priority,

    /// Opaque serialized payload.
    pub payload: String,

    /// Operation ids that must reach `Completed` before this one is ready.
    pub depends_on: Vec<String>,

    /// Current lifecycle state.
    pub state: OperationState,

    /// Number of transmission attempts so far.
    pub attempts: u32,

    /// Last transmission error, if any.
    pub last_error: Option<String>,

    /// Policy deferral: not ready before this instant.
    #[ts(as = "Option<String>")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Role of the author (consumed by the role-precedence conflict rule).
    pub origin_role: Option<String>,

    /// Logical timestamp of the local change (consumed by the recency rule).
    #[ts(as = "String")]
    pub changed_at: DateTime<Utc>,

    /// FIFO tiebreak within a priority tier, assigned by the journal.
    pub enqueue_seq: u64,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Creates a fresh `Queued` operation. Time is an input: the caller
    /// supplies `now` so this crate stays deterministic.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        entity_key: impl Into<String>,
        priority: Priority,
        payload: impl Into<String>,
        depends_on: Vec<String>,
        origin_role: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Operation {
            id: id.into(),
            kind: kind.into(),
            entity_key: entity_key.into(),
            priority,
            payload: payload.into(),
            depends_on,
            state: OperationState::Queued,
            attempts: 0,
            last_error: None,
            scheduled_for: None,
            origin_role,
            changed_at: now,
            enqueue_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the operation has left the live log.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// True while re-enqueueing the same id must merge instead of duplicate.
    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            OperationState::Queued | OperationState::Admitted | OperationState::InFlight
        )
    }
}

// =============================================================================
// Ack Outcome
// =============================================================================

/// Terminal outcome reported to `OperationLog::ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AckOutcome {
    /// Remote confirmed the operation.
    Completed,
    /// Resolver parked the operation for manual resolution.
    Conflicted,
    /// Retries exhausted or non-retryable failure.
    Failed { error: String },
}

// =============================================================================
// Queue Snapshot
// =============================================================================

/// Point-in-time view of the operation log, for status queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueSnapshot {
    /// Operations currently in the live log (all non-terminal states).
    pub total: usize,
    pub queued: usize,
    pub admitted: usize,
    pub in_flight: usize,
    pub conflicted: usize,
    /// Live operations per priority tier, descending urgency.
    pub by_priority: Vec<PriorityCount>,
    /// Earliest pending policy deferral, if any.
    #[ts(as = "Option<String>")]
    pub next_scheduled_for: Option<DateTime<Utc>>,
}

/// One row of the per-tier breakdown in [`QueueSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PriorityCount {
    pub priority: Priority,
    pub count: usize,
}

// =============================================================================
// Network Class
// =============================================================================

/// Connectivity classes observed by the Connectivity Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Offline,
    Cellular,
    Wifi,
}

impl NetworkClass {
    /// True for any state that can carry traffic.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        !matches!(self, NetworkClass::Offline)
    }
}

impl std::fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkClass::Offline => write!(f, "offline"),
            NetworkClass::Cellular => write!(f, "cellular"),
            NetworkClass::Wifi => write!(f, "wifi"),
        }
    }
}

// =============================================================================
// Conflict Model
// =============================================================================

/// One side of a conflict: a value plus the metadata the precedence rules
/// consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VersionedChange {
    /// Serialized value.
    pub value: String,

    /// Validated logical timestamp of the change.
    #[ts(as = "String")]
    pub changed_at: DateTime<Utc>,

    /// Originating role, if identifiable.
    pub role: Option<String>,

    /// Hex SHA-256 of `value`, when the producer supplied one.
    pub checksum: Option<String>,
}

/// A detected divergence between a local operation and a remote change
/// targeting the same `entity_key`.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Conflict {
    /// Unique conflict id.
    pub id: String,

    /// The local operation involved.
    pub operation_id: String,

    /// Change-type tag (drives the protected/sensitive rules).
    pub kind: String,

    /// The contested data key.
    pub entity_key: String,

    /// Local side.
    pub local: VersionedChange,

    /// Remote side.
    pub remote: VersionedChange,
}

/// How a conflict was (or was not) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// A combined value was produced (manual resolution path).
    Merged,
    /// Never auto-resolved; surfaced to the host for a human decision.
    ManualRequired,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep_local"),
            Resolution::KeepRemote => write!(f, "keep_remote"),
            Resolution::Merged => write!(f, "merged"),
            Resolution::ManualRequired => write!(f, "manual_required"),
        }
    }
}

/// Which precedence rule decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    ProtectedField,
    RolePrecedence,
    ContentSensitivity,
    Recency,
    /// A human supplied the resolution for a parked conflict.
    Manual,
}

impl std::fmt::Display for ConflictRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictRule::ProtectedField => write!(f, "protected_field"),
            ConflictRule::RolePrecedence => write!(f, "role_precedence"),
            ConflictRule::ContentSensitivity => write!(f, "content_sensitivity"),
            ConflictRule::Recency => write!(f, "recency"),
            ConflictRule::Manual => write!(f, "manual"),
        }
    }
}

/// Immutable audit record of one resolver invocation.
///
/// Appended to the append-only `conflict_audit` table by the coordinator;
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictAudit {
    pub id: String,
    pub operation_id: String,
    pub entity_key: String,
    pub rule: ConflictRule,
    pub resolution: Resolution,
    /// Local value at resolution time (before).
    pub local_value: String,
    /// Remote value at resolution time (before).
    pub remote_value: String,
    /// Winning value (after), absent for `ManualRequired`.
    pub resolved_value: Option<String>,
    #[ts(as = "String")]
    pub audited_at: DateTime<Utc>,
}

/// A host-supplied decision for a conflict that was parked `ManualRequired`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case", tag = "choice", content = "value")]
pub enum ManualResolution {
    KeepLocal,
    KeepRemote,
    /// The host produced a combined value; it replaces the payload and the
    /// operation re-enters the queue.
    Merged(String),
}

// =============================================================================
// Remote Delta Model
// =============================================================================

/// A single remote change pulled since the last cursor.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RemoteChange {
    /// Data key the change targets.
    pub entity_key: String,

    /// Change-type tag.
    pub kind: String,

    /// Serialized value.
    pub value: String,

    /// Validated remote timestamp.
    #[ts(as = "String")]
    pub changed_at: DateTime<Utc>,

    /// Originating role, if the backend tracks one.
    pub role: Option<String>,

    /// Hex SHA-256 of `value`, required for protected kinds.
    pub checksum: Option<String>,
}

impl RemoteChange {
    /// The remote side of a conflict, as the resolver sees it.
    pub fn as_versioned(&self) -> VersionedChange {
        VersionedChange {
            value: self.value.clone(),
            changed_at: self.changed_at,
            role: self.role.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

// =============================================================================
// Cache Model
// =============================================================================

/// Metadata for one cache entry (the value itself stays in the store).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CacheEntry {
    pub key: String,
    pub priority: Priority,
    /// Pinned entries are never evicted automatically.
    pub pinned: bool,
    /// Stored as a sealed blob when true.
    pub encrypted: bool,
    /// Hex SHA-256 of the plaintext value.
    pub checksum: String,
    pub size_bytes: u64,
    #[ts(as = "Option<String>")]
    pub expires_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub last_access_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True when the tiered eviction policy may reclaim this entry.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        !self.pinned && self.priority != Priority::Critical
    }

    /// TTL check against a supplied instant.
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub quarantined: u64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_total_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Background);
    }

    #[test]
    fn test_priority_rank_roundtrip() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(99), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OperationState::Completed.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::Conflicted.is_terminal());
        assert!(!OperationState::Queued.is_terminal());
    }

    #[test]
    fn test_operation_liveness() {
        let now = Utc::now();
        let mut op = Operation::new(
            "op-1",
            "update-progress",
            "progress/user-1",
            Priority::Medium,
            "{}",
            vec![],
            None,
            now,
        );
        assert!(op.is_live());

        op.state = OperationState::Conflicted;
        assert!(!op.is_live());
        assert!(!op.is_terminal());

        op.state = OperationState::Completed;
        assert!(op.is_terminal());
    }

    #[test]
    fn test_cache_entry_evictability() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".into(),
            priority: Priority::Critical,
            pinned: false,
            encrypted: false,
            checksum: String::new(),
            size_bytes: 0,
            expires_at: None,
            created_at: now,
            updated_at: now,
            last_access_at: now,
        };
        assert!(!entry.is_evictable());

        let pinned = CacheEntry {
            priority: Priority::Low,
            pinned: true,
            ..entry.clone()
        };
        assert!(!pinned.is_evictable());

        let plain = CacheEntry {
            priority: Priority::Low,
            pinned: false,
            ..entry
        };
        assert!(plain.is_evictable());
    }
}
