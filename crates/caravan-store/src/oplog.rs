//! # Operation Log
//!
//! Durable, ordered, priority-aware store of pending local changes.
//!
//! ## Write-Ahead Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Operation Log Persistence                            │
//! │                                                                         │
//! │  MUTATION (enqueue / state change / ack)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  1. INSERT INTO op_journal (record)      ← committed FIRST             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. Apply to in-memory index             ← visible to readers AFTER    │
//! │                                                                         │
//! │  CHECKPOINT (periodic, from the coordinator)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO op_checkpoints (snapshot, journal_seq)                    │
//! │  DELETE FROM op_journal WHERE seq <= journal_seq                       │
//! │                                                                         │
//! │  RESTART                                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Load latest checkpoint → replay journal tail → identical states       │
//! │                                                                         │
//! │  A crash between journal append and checkpoint replays from the last   │
//! │  durable record: no lost or duplicated terminal operations.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//! `dequeue_ready` returns strict priority order; within a tier, insertion
//! order (`enqueue_seq`) is preserved. Only operations whose dependencies
//! are all `Completed` and whose `scheduled_for` has elapsed are returned.
//!
//! ## Concurrency
//! Single-writer discipline: every mutation holds the write half of one
//! async lock across the journal append and the index update. Readers take
//! the read half and see a stable snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use caravan_core::types::{
    AckOutcome, Operation, OperationState, Priority, PriorityCount, QueueSnapshot,
};
use caravan_core::validation::validate_operation;

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Journal Records
// =============================================================================

/// One append-only journal entry. Records carry absolute values (never
/// deltas) so replay is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    /// A new operation entered the log.
    Enqueue { op: Operation },

    /// Lifecycle bookkeeping: admission, flight, deferral, attempts.
    StateChange {
        id: String,
        state: OperationState,
        attempts: u32,
        last_error: Option<String>,
        scheduled_for: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    },

    /// Manual merged resolution replaced the payload.
    PayloadReplace {
        id: String,
        payload: String,
        changed_at: DateTime<Utc>,
    },

    /// Terminal (or parked) outcome.
    Ack {
        id: String,
        outcome: AckOutcome,
        at: DateTime<Utc>,
    },

    /// Caller cancelled a still-queued operation.
    Cancel { id: String },
}

/// Snapshot written at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueCheckpoint {
    operations: Vec<Operation>,
    completed: Vec<String>,
    next_enqueue_seq: u64,
}

// =============================================================================
// In-Memory Index
// =============================================================================

/// The replayed view of the journal.
#[derive(Debug, Default)]
struct LogState {
    /// Live (non-terminal) operations by id.
    live: HashMap<String, Operation>,

    /// Ids that reached `Completed` - consulted for dependency gating.
    completed: HashSet<String>,

    /// Next FIFO tiebreak value.
    next_enqueue_seq: u64,

    /// Highest journal seq applied to this index.
    last_journal_seq: i64,
}

impl LogState {
    fn apply(&mut self, seq: i64, record: JournalRecord) {
        match record {
            JournalRecord::Enqueue { op } => {
                self.next_enqueue_seq = self.next_enqueue_seq.max(op.enqueue_seq + 1);
                self.live.insert(op.id.clone(), op);
            }
            JournalRecord::StateChange {
                id,
                state,
                attempts,
                last_error,
                scheduled_for,
                updated_at,
            } => {
                if let Some(op) = self.live.get_mut(&id) {
                    op.state = state;
                    op.attempts = attempts;
                    op.last_error = last_error;
                    op.scheduled_for = scheduled_for;
                    op.updated_at = updated_at;
                }
            }
            JournalRecord::PayloadReplace {
                id,
                payload,
                changed_at,
            } => {
                if let Some(op) = self.live.get_mut(&id) {
                    op.payload = payload;
                    op.changed_at = changed_at;
                    op.updated_at = changed_at;
                }
            }
            JournalRecord::Ack { id, outcome, at } => match outcome {
                AckOutcome::Completed => {
                    self.live.remove(&id);
                    self.completed.insert(id);
                }
                AckOutcome::Conflicted => {
                    if let Some(op) = self.live.get_mut(&id) {
                        op.state = OperationState::Conflicted;
                        op.updated_at = at;
                    }
                }
                AckOutcome::Failed { error: _ } => {
                    // Terminal: the operation leaves the live log. The
                    // journal row retains the failure for diagnostics.
                    self.live.remove(&id);
                }
            },
            JournalRecord::Cancel { id } => {
                self.live.remove(&id);
            }
        }
        self.last_journal_seq = self.last_journal_seq.max(seq);
    }
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct JournalRow {
    seq: i64,
    record: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    journal_seq: i64,
    snapshot: String,
}

// =============================================================================
// Operation Log
// =============================================================================

/// The durable operation queue.
#[derive(Debug, Clone)]
pub struct OperationLog {
    pool: SqlitePool,
    state: Arc<RwLock<LogState>>,
}

impl OperationLog {
    /// Opens the log: loads the latest checkpoint and replays the journal
    /// tail, reconstructing exactly the pre-restart states.
    pub async fn open(pool: SqlitePool) -> StoreResult<Self> {
        let mut state = LogState::default();

        let checkpoint = sqlx::query_as::<_, CheckpointRow>(
            "SELECT journal_seq, snapshot FROM op_checkpoints ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&pool)
        .await?;

        if let Some(row) = checkpoint {
            let snapshot: QueueCheckpoint = serde_json::from_str(&row.snapshot)?;
            for op in snapshot.operations {
                state.live.insert(op.id.clone(), op);
            }
            state.completed = snapshot.completed.into_iter().collect();
            state.next_enqueue_seq = snapshot.next_enqueue_seq;
            state.last_journal_seq = row.journal_seq;
        }

        let tail = sqlx::query_as::<_, JournalRow>(
            "SELECT seq, record FROM op_journal WHERE seq > ?1 ORDER BY seq ASC",
        )
        .bind(state.last_journal_seq)
        .fetch_all(&pool)
        .await?;

        let replayed = tail.len();
        for row in tail {
            let record: JournalRecord = serde_json::from_str(&row.record)?;
            state.apply(row.seq, record);
        }

        info!(
            live = state.live.len(),
            replayed, "Operation log opened"
        );

        Ok(OperationLog {
            pool,
            state: Arc::new(RwLock::new(state)),
        })
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Enqueues an operation.
    ///
    /// ## Semantics
    /// - A malformed operation fails synchronously with a validation error
    ///   and never touches the journal.
    /// - Re-enqueueing an id that is still live is a no-op merge: the
    ///   existing entry is kept, no duplicate is created.
    /// - The journal record is committed before the operation becomes
    ///   visible to readers.
    pub async fn enqueue(&self, mut op: Operation) -> StoreResult<String> {
        validate_operation(&op)?;

        let mut state = self.state.write().await;

        if state.live.contains_key(&op.id) {
            debug!(id = %op.id, "Re-enqueue of live operation merged as no-op");
            return Ok(op.id);
        }
        if state.completed.contains(&op.id) {
            // Processed at most once to completion: a replayed submission
            // of a finished id must not run again.
            debug!(id = %op.id, "Operation already completed, enqueue ignored");
            return Ok(op.id);
        }

        op.enqueue_seq = state.next_enqueue_seq;
        op.state = OperationState::Queued;

        let seq = self
            .append(&JournalRecord::Enqueue { op: op.clone() })
            .await?;

        debug!(id = %op.id, kind = %op.kind, priority = %op.priority, "Operation enqueued");
        state.apply(seq, JournalRecord::Enqueue { op: op.clone() });
        Ok(op.id)
    }

    /// Cancels a still-queued operation. Returns false (and changes
    /// nothing) once the operation has been admitted or later.
    pub async fn cancel(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;

        match state.live.get(id) {
            Some(op) if op.state == OperationState::Queued => {}
            _ => return Ok(false),
        }

        let record = JournalRecord::Cancel { id: id.to_string() };
        let seq = self.append(&record).await?;
        state.apply(seq, record);

        debug!(id = %id, "Operation cancelled");
        Ok(true)
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// Returns up to `max` ready operations: state `Queued`, dependencies
    /// all `Completed`, deferral elapsed. Strict priority order, FIFO
    /// within a tier.
    pub async fn dequeue_ready(&self, max: usize) -> StoreResult<Vec<Operation>> {
        let now = Utc::now();
        let state = self.state.read().await;

        let mut ready: Vec<&Operation> = state
            .live
            .values()
            .filter(|op| op.state == OperationState::Queued)
            .filter(|op| op.scheduled_for.map(|t| t <= now).unwrap_or(true))
            .filter(|op| op.depends_on.iter().all(|d| state.completed.contains(d)))
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueue_seq.cmp(&b.enqueue_seq))
        });
        ready.truncate(max);

        Ok(ready.into_iter().cloned().collect())
    }

    /// Fetches a single live operation.
    pub async fn get(&self, id: &str) -> Option<Operation> {
        self.state.read().await.live.get(id).cloned()
    }

    /// All operations currently parked for manual conflict resolution.
    pub async fn conflicted(&self) -> Vec<Operation> {
        let state = self.state.read().await;
        state
            .live
            .values()
            .filter(|op| op.state == OperationState::Conflicted)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Lifecycle Transitions
    // =========================================================================

    /// `Queued → Admitted`: selected for the current session.
    pub async fn mark_admitted(&self, id: &str) -> StoreResult<()> {
        self.state_change(id, |op| op.state = OperationState::Admitted)
            .await
    }

    /// `Admitted → InFlight`: transmission started.
    pub async fn mark_in_flight(&self, id: &str) -> StoreResult<()> {
        self.state_change(id, |op| op.state = OperationState::InFlight)
            .await
    }

    /// Records one transmission attempt (success or failure).
    pub async fn note_attempt(&self, id: &str, error: Option<String>) -> StoreResult<()> {
        self.state_change(id, |op| {
            op.attempts += 1;
            op.last_error = error;
        })
        .await
    }

    /// Policy deferral: stays `Queued`, not ready before `until`.
    pub async fn defer(&self, id: &str, until: DateTime<Utc>) -> StoreResult<()> {
        self.state_change(id, |op| {
            op.state = OperationState::Queued;
            op.scheduled_for = Some(until);
        })
        .await
    }

    /// Cancellation/teardown path: an in-flight operation reverts to
    /// `Queued` with the attempt counter incremented.
    pub async fn revert_to_queued(&self, id: &str) -> StoreResult<()> {
        self.state_change(id, |op| {
            op.state = OperationState::Queued;
            op.attempts += 1;
        })
        .await
    }

    /// Returns an operation to `Queued` without touching the attempt
    /// counter (e.g. a push-time conflict resolved in the local value's
    /// favor, to be retransmitted next session).
    pub async fn requeue(&self, id: &str) -> StoreResult<()> {
        self.state_change(id, |op| {
            op.state = OperationState::Queued;
            op.scheduled_for = None;
        })
        .await
    }

    /// Reopens a `Conflicted` operation after manual resolution. A merged
    /// value replaces the payload before the operation re-enters the queue.
    pub async fn reopen_conflicted(
        &self,
        id: &str,
        new_payload: Option<String>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let op = state
            .live
            .get(id)
            .ok_or_else(|| StoreError::not_found("Operation", id))?;
        if op.state != OperationState::Conflicted {
            warn!(id = %id, state = %op.state, "reopen_conflicted on non-conflicted operation");
            return Ok(());
        }

        if let Some(payload) = new_payload {
            let record = JournalRecord::PayloadReplace {
                id: id.to_string(),
                payload,
                changed_at: Utc::now(),
            };
            let seq = self.append(&record).await?;
            state.apply(seq, record);
        }

        let op = state
            .live
            .get(id)
            .ok_or_else(|| StoreError::not_found("Operation", id))?;
        let record = JournalRecord::StateChange {
            id: id.to_string(),
            state: OperationState::Queued,
            attempts: op.attempts,
            last_error: op.last_error.clone(),
            scheduled_for: None,
            updated_at: Utc::now(),
        };
        let seq = self.append(&record).await?;
        state.apply(seq, record);
        Ok(())
    }

    /// Records a terminal (or parked) outcome.
    ///
    /// `Completed` and `Failed` remove the operation from the live log;
    /// `Completed` additionally unlocks dependents. `Conflicted` parks the
    /// operation for manual resolution.
    pub async fn ack(&self, id: &str, outcome: AckOutcome) -> StoreResult<()> {
        let mut state = self.state.write().await;

        if !state.live.contains_key(id) {
            return Err(StoreError::not_found("Operation", id));
        }

        let record = JournalRecord::Ack {
            id: id.to_string(),
            outcome,
            at: Utc::now(),
        };
        let seq = self.append(&record).await?;
        state.apply(seq, record);
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Point-in-time queue snapshot.
    pub async fn peek_status(&self) -> QueueSnapshot {
        let state = self.state.read().await;

        let mut snapshot = QueueSnapshot {
            total: state.live.len(),
            ..QueueSnapshot::default()
        };

        let mut per_tier: HashMap<Priority, usize> = HashMap::new();
        for op in state.live.values() {
            match op.state {
                OperationState::Queued => snapshot.queued += 1,
                OperationState::Admitted => snapshot.admitted += 1,
                OperationState::InFlight => snapshot.in_flight += 1,
                OperationState::Conflicted => snapshot.conflicted += 1,
                // Terminal states never stay in the live map.
                OperationState::Completed | OperationState::Failed => {}
            }
            *per_tier.entry(op.priority).or_default() += 1;

            if op.state == OperationState::Queued {
                if let Some(t) = op.scheduled_for {
                    snapshot.next_scheduled_for = Some(match snapshot.next_scheduled_for {
                        Some(existing) => existing.min(t),
                        None => t,
                    });
                }
            }
        }

        snapshot.by_priority = Priority::ALL
            .iter()
            .filter_map(|p| {
                per_tier.get(p).map(|count| PriorityCount {
                    priority: *p,
                    count: *count,
                })
            })
            .collect();

        snapshot
    }

    // =========================================================================
    // Checkpointing
    // =========================================================================

    /// Snapshots the live set and prunes the journal rows it covers.
    /// Restart cost becomes one snapshot load plus the journal tail.
    pub async fn checkpoint(&self) -> StoreResult<()> {
        let state = self.state.write().await;

        let snapshot = QueueCheckpoint {
            operations: state.live.values().cloned().collect(),
            completed: state.completed.iter().cloned().collect(),
            next_enqueue_seq: state.next_enqueue_seq,
        };
        let json = serde_json::to_string(&snapshot)?;
        let covered = state.last_journal_seq;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO op_checkpoints (journal_seq, snapshot, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(covered)
        .bind(&json)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM op_journal WHERE seq <= ?1")
            .bind(covered)
            .execute(&mut *tx)
            .await?;

        // Only the newest checkpoint is ever loaded; drop the rest.
        sqlx::query(
            "DELETE FROM op_checkpoints WHERE id < (SELECT MAX(id) FROM op_checkpoints)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            live = snapshot.operations.len(),
            journal_seq = covered,
            "Operation log checkpointed"
        );
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Appends one journal record. Callers hold the write lock, which is
    /// what makes journal order match index order.
    async fn append(&self, record: &JournalRecord) -> StoreResult<i64> {
        let json = serde_json::to_string(record)?;
        let result = sqlx::query("INSERT INTO op_journal (record, created_at) VALUES (?1, ?2)")
            .bind(&json)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn state_change(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Operation),
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let mut op = state
            .live
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Operation", id))?;
        mutate(&mut op);

        let record = JournalRecord::StateChange {
            id: op.id.clone(),
            state: op.state,
            attempts: op.attempts,
            last_error: op.last_error.clone(),
            scheduled_for: op.scheduled_for,
            updated_at: Utc::now(),
        };
        let seq = self.append(&record).await?;
        state.apply(seq, record);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Store, StoreConfig};

    async fn fresh_log() -> (Store, OperationLog) {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let log = OperationLog::open(store.pool().clone()).await.unwrap();
        (store, log)
    }

    fn op(id: &str, priority: Priority) -> Operation {
        Operation::new(
            id,
            "update-progress",
            format!("progress/{id}"),
            priority,
            "{}",
            vec![],
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_within_tier() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("low-1", Priority::Low)).await.unwrap();
        log.enqueue(op("high-1", Priority::High)).await.unwrap();
        log.enqueue(op("low-2", Priority::Low)).await.unwrap();
        log.enqueue(op("critical-1", Priority::Critical)).await.unwrap();
        log.enqueue(op("high-2", Priority::High)).await.unwrap();

        let ready = log.dequeue_ready(10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["critical-1", "high-1", "high-2", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_reenqueue_live_id_is_noop_merge() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        let mut duplicate = op("op-1", Priority::Critical);
        duplicate.payload = "different".into();
        log.enqueue(duplicate).await.unwrap();

        let ready = log.dequeue_ready(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        // First write wins: the merge keeps the original entry.
        assert_eq!(ready[0].priority, Priority::Medium);
        assert_eq!(ready[0].payload, "{}");
    }

    #[tokio::test]
    async fn test_completed_id_cannot_run_again() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        log.ack("op-1", AckOutcome::Completed).await.unwrap();

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        assert!(log.dequeue_ready(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_operation_never_journaled() {
        let (store, log) = fresh_log().await;

        let err = log.enqueue(op("", Priority::Medium)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM op_journal")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("parent", Priority::Medium)).await.unwrap();
        let mut child = op("child", Priority::Critical);
        child.depends_on = vec!["parent".into()];
        log.enqueue(child).await.unwrap();

        // Child outranks parent but is not ready while the dependency is
        // open.
        let ready = log.dequeue_ready(10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["parent"]);

        log.ack("parent", AckOutcome::Completed).await.unwrap();

        let ready = log.dequeue_ready(10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["child"]);
    }

    #[tokio::test]
    async fn test_deferred_operation_not_ready() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Low)).await.unwrap();
        log.defer("op-1", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert!(log.dequeue_ready(10).await.unwrap().is_empty());

        let snapshot = log.peek_status().await;
        assert_eq!(snapshot.queued, 1);
        assert!(snapshot.next_scheduled_for.is_some());
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        log.enqueue(op("op-2", Priority::Medium)).await.unwrap();
        log.mark_admitted("op-2").await.unwrap();

        assert!(log.cancel("op-1").await.unwrap());
        assert!(!log.cancel("op-2").await.unwrap());
        assert!(!log.cancel("ghost").await.unwrap());

        assert!(log.get("op-1").await.is_none());
        assert!(log.get("op-2").await.is_some());
    }

    #[tokio::test]
    async fn test_revert_to_queued_increments_attempts() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        log.mark_admitted("op-1").await.unwrap();
        log.mark_in_flight("op-1").await.unwrap();
        log.revert_to_queued("op-1").await.unwrap();

        let reverted = log.get("op-1").await.unwrap();
        assert_eq!(reverted.state, OperationState::Queued);
        assert_eq!(reverted.attempts, 1);
    }

    #[tokio::test]
    async fn test_conflicted_parks_and_reopens() {
        let (_store, log) = fresh_log().await;

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        log.ack("op-1", AckOutcome::Conflicted).await.unwrap();

        assert!(log.dequeue_ready(10).await.unwrap().is_empty());
        assert_eq!(log.conflicted().await.len(), 1);

        log.reopen_conflicted("op-1", Some("merged-value".into()))
            .await
            .unwrap();
        let ready = log.dequeue_ready(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].payload, "merged-value");
    }

    #[tokio::test]
    async fn test_crash_replay_reproduces_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caravan.db");

        // First process lifetime: build up state, checkpoint midway so the
        // replay exercises checkpoint + journal tail together.
        {
            let store = Store::new(StoreConfig::new(&path)).await.unwrap();
            let log = OperationLog::open(store.pool().clone()).await.unwrap();

            log.enqueue(op("done", Priority::High)).await.unwrap();
            log.enqueue(op("pending", Priority::Medium)).await.unwrap();
            log.ack("done", AckOutcome::Completed).await.unwrap();

            log.checkpoint().await.unwrap();

            log.enqueue(op("late", Priority::Low)).await.unwrap();
            log.mark_admitted("pending").await.unwrap();
            log.mark_in_flight("pending").await.unwrap();
            log.note_attempt("pending", Some("connection reset".into()))
                .await
                .unwrap();

            store.close().await;
        }

        // Second process lifetime: identical states, nothing lost or
        // duplicated.
        let store = Store::new(StoreConfig::new(&path)).await.unwrap();
        let log = OperationLog::open(store.pool().clone()).await.unwrap();

        assert!(log.get("done").await.is_none(), "terminal op must not revive");

        let pending = log.get("pending").await.unwrap();
        assert_eq!(pending.state, OperationState::InFlight);
        assert_eq!(pending.attempts, 1);
        assert_eq!(pending.last_error.as_deref(), Some("connection reset"));

        let late = log.get("late").await.unwrap();
        assert_eq!(late.state, OperationState::Queued);

        // A dependent of the completed op is still unlocked after replay.
        let mut child = op("child", Priority::Medium);
        child.depends_on = vec!["done".into()];
        log.enqueue(child).await.unwrap();
        let ready = log.dequeue_ready(10).await.unwrap();
        assert!(ready.iter().any(|o| o.id == "child"));
    }

    #[tokio::test]
    async fn test_checkpoint_prunes_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caravan.db");

        let store = Store::new(StoreConfig::new(&path)).await.unwrap();
        let log = OperationLog::open(store.pool().clone()).await.unwrap();

        log.enqueue(op("op-1", Priority::Medium)).await.unwrap();
        log.enqueue(op("op-2", Priority::Medium)).await.unwrap();
        log.checkpoint().await.unwrap();

        let journal_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM op_journal")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(journal_rows, 0);

        // State fully recoverable from the checkpoint alone.
        let reopened = OperationLog::open(store.pool().clone()).await.unwrap();
        assert_eq!(reopened.peek_status().await.queued, 2);
    }
}
