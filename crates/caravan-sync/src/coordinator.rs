//! # Sync Coordinator
//!
//! Orchestrates batches: pulls remote deltas, reconciles conflicts, pushes
//! eligible local operations, and updates the Operation Log and Cache Store
//! transactionally.
//!
//! ## Session Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      run_session(max_batch)                             │
//! │                                                                         │
//! │  1. PULLING DELTA                                                      │
//! │     remote.pull(cursor) ──► CacheStore::merge_remote                   │
//! │     (merge + cursor advancement are one transaction; a fatal           │
//! │      mismatch aborts with NO cursor advancement)                       │
//! │                                                                         │
//! │  2. RECONCILING                                                        │
//! │     every ready operation whose entity_key was touched remotely        │
//! │     becomes a Conflict → resolver → audit row + event                  │
//! │       ManualRequired → park Conflicted, exclude from push              │
//! │       KeepRemote     → operation superseded (Completed, not pushed)    │
//! │       KeepLocal      → local value restored to cache, still pushed     │
//! │                                                                         │
//! │  3. PUSHING OPERATIONS                                                 │
//! │     Policy Gate admits/defers → strict priority order, tier by tier,   │
//! │     bounded worker pool inside each tier                               │
//! │       transient failure → exponential backoff with jitter,             │
//! │                           bounded attempts, then terminal Failed       │
//! │       failure streak    → circuit breaker suspends pushing for a       │
//! │                           cool-down (pulls keep running)               │
//! │       cancellation      → InFlight reverts to Queued, attempts + 1     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use caravan_core::integrity::checksum_hex;
use caravan_core::policy::{Admission, PolicyContext, PolicyGate};
use caravan_core::resolver::ConflictResolver;
use caravan_core::types::{
    AckOutcome, Conflict, ConflictAudit, Operation, Priority, RemoteChange, Resolution,
    VersionedChange,
};
use caravan_store::audit::ConflictAuditLog;
use caravan_store::cache::{CacheStore, SetOptions};
use caravan_store::oplog::OperationLog;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::remote::{PushResponse, RemoteEndpoint};
use crate::session::{CancelToken, SessionPhase, SessionReport, SyncOutcome};

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Trips after a sustained terminal-failure streak; while open, the push
/// phase is suspended for the cool-down and pulls proceed unaffected.
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    cooldown: chrono::Duration,
    failure_streak: u32,
    open_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            threshold,
            cooldown: chrono::Duration::seconds(cooldown_secs as i64),
            failure_streak: 0,
            open_until: None,
        }
    }

    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.open_until.map(|t| now < t).unwrap_or(false)
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_streak += 1;
        if self.failure_streak >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            warn!(
                streak = self.failure_streak,
                cooldown_secs = self.cooldown.num_seconds(),
                "Circuit breaker tripped, pushing suspended"
            );
        }
    }

    fn record_success(&mut self) {
        self.failure_streak = 0;
        self.open_until = None;
    }
}

// =============================================================================
// Push Outcomes
// =============================================================================

/// How one push worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    /// Remote confirmed; operation Completed.
    Acked,
    /// Retries exhausted or non-retryable failure; operation Failed.
    Failed,
    /// Push-time conflict resolved for the remote; operation superseded.
    Superseded,
    /// Push-time conflict resolved for the local value; retransmitted next
    /// session.
    Requeued,
    /// Push-time conflict parked for manual resolution.
    ManualRequired,
    /// Cancellation token fired; operation reverted to Queued.
    Cancelled,
    /// Fatal remote mismatch; session must abort.
    FatalAbort,
}

// =============================================================================
// Sync Coordinator
// =============================================================================

/// The session orchestrator. Cloneable: every field is a shared handle, so
/// push workers run against the same log, cache, breaker, and event bus.
#[derive(Clone)]
pub struct SyncCoordinator {
    log: OperationLog,
    cache: CacheStore,
    audits: ConflictAuditLog,
    remote: Arc<dyn RemoteEndpoint>,
    gate: Arc<PolicyGate>,
    resolver: Arc<ConflictResolver>,
    events: EventBus,
    settings: Arc<SyncSettings>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    sessions_since_checkpoint: Arc<Mutex<u32>>,
}

impl SyncCoordinator {
    /// Creates a coordinator over constructor-injected services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: OperationLog,
        cache: CacheStore,
        audits: ConflictAuditLog,
        remote: Arc<dyn RemoteEndpoint>,
        gate: PolicyGate,
        resolver: ConflictResolver,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            settings.breaker_threshold,
            settings.breaker_cooldown_secs,
        );
        SyncCoordinator {
            log,
            cache,
            audits,
            remote,
            gate: Arc::new(gate),
            resolver: Arc::new(resolver),
            events,
            settings: Arc::new(settings),
            breaker: Arc::new(Mutex::new(breaker)),
            sessions_since_checkpoint: Arc::new(Mutex::new(0)),
        }
    }

    /// True while the breaker is suspending pushes.
    pub async fn circuit_open(&self) -> bool {
        self.breaker.lock().await.is_open(Utc::now())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Runs one full session: pull → reconcile → push.
    ///
    /// `max_batch` and `concurrency` arrive pre-degraded by the caller
    /// (Connectivity Monitor factors). `ctx` is the policy snapshot for
    /// this session; `cancel` tears the session down at any suspension
    /// point.
    pub async fn run_session(
        &self,
        max_batch: usize,
        concurrency: usize,
        ctx: PolicyContext,
        cancel: CancelToken,
    ) -> SyncResult<SessionReport> {
        let session_id = Uuid::new_v4().to_string();
        let mut report = SessionReport::begin(session_id.as_str(), Utc::now());

        info!(session_id = %session_id, max_batch, concurrency, "Sync session starting");
        self.events.emit(SyncEvent::SyncStarted {
            session_id: session_id.clone(),
        });

        // ---- Phase: PullingDelta ------------------------------------------
        debug!(session_id = %session_id, phase = %SessionPhase::PullingDelta, "Phase change");
        let mut remote_touched: HashMap<String, RemoteChange> = HashMap::new();

        let cursor = self.cache.cursor().await?;
        let pull = timeout(
            Duration::from_secs(self.settings.pull_timeout_secs),
            self.remote.pull(cursor.as_deref()),
        )
        .await;

        match pull {
            Err(_) => {
                warn!(session_id = %session_id, "Pull timed out");
                report.outcome = SyncOutcome::PartialFailure;
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!(session_id = %session_id, error = %e, "Fatal pull, aborting session");
                report.outcome = SyncOutcome::Fatal;
                return self.finish(report).await;
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Pull failed transiently");
                report.outcome = SyncOutcome::PartialFailure;
            }
            Ok(Ok(response)) => {
                if !response.changes.is_empty()
                    || cursor.as_deref() != Some(response.new_cursor.as_str())
                {
                    self.cache
                        .merge_remote(&response.changes, &response.new_cursor)
                        .await?;
                }
                report.pulled = response.changes.len();
                for change in response.changes {
                    remote_touched.insert(change.entity_key.clone(), change);
                }
            }
        }

        if cancel.is_cancelled() {
            report.outcome = SyncOutcome::Cancelled;
            return self.finish(report).await;
        }

        // ---- Phase: Reconciling -------------------------------------------
        debug!(session_id = %session_id, phase = %SessionPhase::Reconciling, "Phase change");
        let batch = self.log.dequeue_ready(max_batch).await?;
        let mut push_batch: Vec<Operation> = Vec::with_capacity(batch.len());

        for op in batch {
            let Some(change) = remote_touched.get(&op.entity_key) else {
                push_batch.push(op);
                continue;
            };

            report.conflicts_detected += 1;
            match self.adjudicate(&op, change.as_versioned()).await? {
                Resolution::ManualRequired => {
                    self.log.ack(&op.id, AckOutcome::Conflicted).await?;
                    report.manual_required += 1;
                }
                Resolution::KeepRemote => {
                    // The merge already wrote the remote value; the local
                    // operation is superseded without transmission.
                    self.log.ack(&op.id, AckOutcome::Completed).await?;
                    report.conflicts_auto_resolved += 1;
                }
                Resolution::KeepLocal | Resolution::Merged => {
                    // Restore the local value over the merged remote one,
                    // then push it.
                    self.cache
                        .set(
                            &op.entity_key,
                            op.payload.as_bytes(),
                            SetOptions {
                                priority: op.priority,
                                ..SetOptions::default()
                            },
                        )
                        .await?;
                    report.conflicts_auto_resolved += 1;
                    push_batch.push(op);
                }
            }
        }

        // ---- Phase: PushingOperations -------------------------------------
        debug!(session_id = %session_id, phase = %SessionPhase::PushingOperations, "Phase change");
        if self.breaker.lock().await.is_open(Utc::now()) {
            report.push_suspended = true;
            warn!(session_id = %session_id, "Circuit open, push phase suspended");
        } else {
            self.push_phase(push_batch, concurrency, &ctx, &cancel, &mut report)
                .await?;
        }

        if report.outcome == SyncOutcome::Completed && report.failed > 0 {
            report.outcome = SyncOutcome::PartialFailure;
        }
        self.finish(report).await
    }

    /// Admits via the Policy Gate, then drains tier by tier: strict
    /// priority order across tiers, bounded workers inside each.
    async fn push_phase(
        &self,
        push_batch: Vec<Operation>,
        concurrency: usize,
        ctx: &PolicyContext,
        cancel: &CancelToken,
        report: &mut SessionReport,
    ) -> SyncResult<()> {
        let mut admitted: Vec<Operation> = Vec::with_capacity(push_batch.len());

        for op in push_batch {
            match self.gate.evaluate(&op, ctx) {
                Admission::Admit => admitted.push(op),
                Admission::Defer { reason, until } => {
                    debug!(id = %op.id, reason = %reason, until = %until, "Deferred by policy");
                    self.log.defer(&op.id, until).await?;
                    report.deferred += 1;
                }
            }
        }

        'tiers: for tier in Priority::ALL {
            let tier_ops: Vec<Operation> = admitted
                .iter()
                .filter(|op| op.priority == tier)
                .cloned()
                .collect();
            if tier_ops.is_empty() {
                continue;
            }

            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            let mut workers: JoinSet<SyncResult<PushOutcome>> = JoinSet::new();

            for op in tier_ops {
                let this = self.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                workers.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| SyncError::ChannelError("worker pool closed".into()))?;
                    this.push_one(op, cancel).await
                });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => match outcome {
                        PushOutcome::Acked => report.pushed += 1,
                        PushOutcome::Failed => report.failed += 1,
                        PushOutcome::Superseded => {
                            report.conflicts_detected += 1;
                            report.conflicts_auto_resolved += 1;
                        }
                        PushOutcome::Requeued => {
                            report.conflicts_detected += 1;
                            report.conflicts_auto_resolved += 1;
                        }
                        PushOutcome::ManualRequired => {
                            report.conflicts_detected += 1;
                            report.manual_required += 1;
                        }
                        PushOutcome::Cancelled => report.outcome = SyncOutcome::Cancelled,
                        PushOutcome::FatalAbort => report.outcome = SyncOutcome::Fatal,
                    },
                    Ok(Err(e)) => {
                        error!(error = %e, "Push worker failed");
                        report.failed += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "Push worker panicked");
                        report.failed += 1;
                    }
                }
            }

            if matches!(report.outcome, SyncOutcome::Cancelled | SyncOutcome::Fatal) {
                break 'tiers;
            }
        }

        Ok(())
    }

    /// Transmits one operation with bounded, jittered retries.
    async fn push_one(&self, op: Operation, cancel: CancelToken) -> SyncResult<PushOutcome> {
        self.log.mark_admitted(&op.id).await?;
        self.log.mark_in_flight(&op.id).await?;

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.settings.initial_backoff_ms),
            max_interval: Duration::from_secs(self.settings.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut tries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.log.revert_to_queued(&op.id).await?;
                return Ok(PushOutcome::Cancelled);
            }

            tries += 1;
            let attempt = timeout(
                Duration::from_secs(self.settings.push_timeout_secs),
                self.remote.push(&op),
            )
            .await;
            let attempt: SyncResult<PushResponse> = match attempt {
                Err(_) => Err(SyncError::Timeout(self.settings.push_timeout_secs)),
                Ok(result) => result,
            };

            match attempt {
                Ok(PushResponse::Ack) => {
                    self.log.note_attempt(&op.id, None).await?;
                    self.log.ack(&op.id, AckOutcome::Completed).await?;
                    self.breaker.lock().await.record_success();
                    debug!(id = %op.id, tries, "Push acked");
                    return Ok(PushOutcome::Acked);
                }

                Ok(PushResponse::Conflict { remote }) => {
                    self.log.note_attempt(&op.id, None).await?;
                    return match self.adjudicate(&op, remote.clone()).await? {
                        Resolution::ManualRequired => {
                            self.log.ack(&op.id, AckOutcome::Conflicted).await?;
                            Ok(PushOutcome::ManualRequired)
                        }
                        Resolution::KeepRemote => {
                            self.cache
                                .set(
                                    &op.entity_key,
                                    remote.value.as_bytes(),
                                    SetOptions {
                                        priority: op.priority,
                                        ..SetOptions::default()
                                    },
                                )
                                .await?;
                            self.log.ack(&op.id, AckOutcome::Completed).await?;
                            Ok(PushOutcome::Superseded)
                        }
                        Resolution::KeepLocal | Resolution::Merged => {
                            // The remote holds a losing version; retransmit
                            // next session once it has caught up.
                            self.log.requeue(&op.id).await?;
                            Ok(PushOutcome::Requeued)
                        }
                    };
                }

                Err(e) if e.is_fatal() => {
                    // Not the operation's fault: back to the queue (the
                    // revert counts the interrupted attempt), abort the
                    // session.
                    self.log.revert_to_queued(&op.id).await?;
                    return Ok(PushOutcome::FatalAbort);
                }

                Err(e) if e.is_retryable() && op.attempts + tries < self.settings.max_attempts => {
                    warn!(id = %op.id, tries, error = %e, "Transient push failure, backing off");
                    self.log.note_attempt(&op.id, Some(e.to_string())).await?;

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(self.settings.max_backoff_secs));
                    let mut cancel_wait = cancel.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel_wait.cancelled() => {
                            self.log.revert_to_queued(&op.id).await?;
                            return Ok(PushOutcome::Cancelled);
                        }
                    }
                }

                Err(e) => {
                    // Retries exhausted, or a non-retryable failure:
                    // terminal, surfaced, never retried indefinitely.
                    self.log.note_attempt(&op.id, Some(e.to_string())).await?;
                    self.log
                        .ack(
                            &op.id,
                            AckOutcome::Failed {
                                error: e.to_string(),
                            },
                        )
                        .await?;
                    self.breaker.lock().await.record_failure(Utc::now());
                    self.events.emit(SyncEvent::OperationFailed {
                        id: op.id.clone(),
                        kind: op.kind.clone(),
                        reason: e.to_string(),
                    });
                    warn!(id = %op.id, error = %e, "Operation failed terminally");
                    return Ok(PushOutcome::Failed);
                }
            }
        }
    }

    // =========================================================================
    // Conflict Adjudication
    // =========================================================================

    /// Builds a Conflict from an operation and a remote version, resolves
    /// it, appends the audit row, and emits the events.
    async fn adjudicate(
        &self,
        op: &Operation,
        remote: VersionedChange,
    ) -> SyncResult<Resolution> {
        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            operation_id: op.id.clone(),
            kind: op.kind.clone(),
            entity_key: op.entity_key.clone(),
            local: VersionedChange {
                value: op.payload.clone(),
                changed_at: op.changed_at,
                role: op.origin_role.clone(),
                checksum: Some(checksum_hex(op.payload.as_bytes())),
            },
            remote,
        };

        self.events.emit(SyncEvent::ConflictDetected {
            conflict: conflict.clone(),
        });

        let decision = self.resolver.resolve(&conflict);
        let audit = ConflictAudit::record(
            &conflict,
            &decision,
            Uuid::new_v4().to_string(),
            Utc::now(),
        );
        self.audits.append(&audit).await?;

        info!(
            operation_id = %op.id,
            entity_key = %op.entity_key,
            rule = %decision.rule,
            resolution = %decision.resolution,
            "Conflict adjudicated"
        );

        if decision.resolution != Resolution::ManualRequired {
            self.events.emit(SyncEvent::ConflictResolved {
                operation_id: op.id.clone(),
                entity_key: op.entity_key.clone(),
                rule: decision.rule,
                resolution: decision.resolution,
            });
        }

        Ok(decision.resolution)
    }

    // =========================================================================
    // Session Finish
    // =========================================================================

    /// Stamps the report, emits the closing events, and runs the
    /// checkpoint cadence.
    async fn finish(&self, mut report: SessionReport) -> SyncResult<SessionReport> {
        report.finished_at = Utc::now();

        let snapshot = self.log.peek_status().await;
        self.events.emit(SyncEvent::QueueChanged { snapshot });
        self.events.emit(SyncEvent::SyncCompleted {
            report: report.clone(),
        });

        info!(
            session_id = %report.session_id,
            outcome = %report.outcome,
            pulled = report.pulled,
            pushed = report.pushed,
            failed = report.failed,
            deferred = report.deferred,
            conflicts = report.conflicts_detected,
            "Sync session finished"
        );

        let mut counter = self.sessions_since_checkpoint.lock().await;
        *counter += 1;
        if *counter >= self.settings.checkpoint_every_sessions {
            *counter = 0;
            drop(counter);
            self.log.checkpoint().await?;
        }

        Ok(report)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caravan_core::policy::PolicyConfig;
    use caravan_core::resolver::ResolverRules;
    use caravan_core::types::NetworkClass;
    use caravan_store::pool::{Store, StoreConfig};
    use crate::remote::ScriptedRemote;

    struct Fixture {
        store: Store,
        log: OperationLog,
        cache: CacheStore,
        remote: Arc<ScriptedRemote>,
        coordinator: SyncCoordinator,
        events: EventBus,
    }

    fn test_settings() -> SyncSettings {
        SyncSettings {
            max_attempts: 5,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
            pull_timeout_secs: 5,
            push_timeout_secs: 5,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
            checkpoint_every_sessions: 1000,
            ..SyncSettings::default()
        }
    }

    fn test_rules() -> ResolverRules {
        ResolverRules {
            protected_kinds: Default::default(),
            sensitive_kinds: ["edit-content".to_string()].into(),
            role_ranks: [("instructor".to_string(), 10), ("learner".to_string(), 1)].into(),
        }
    }

    async fn fixture_with(settings: SyncSettings, gate: PolicyGate) -> Fixture {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let log = OperationLog::open(store.pool().clone()).await.unwrap();
        let cache = CacheStore::open(store.pool().clone(), Default::default(), None)
            .await
            .unwrap();
        let audits = ConflictAuditLog::new(store.pool().clone());
        let remote = Arc::new(ScriptedRemote::new());
        let events = EventBus::default();

        let coordinator = SyncCoordinator::new(
            log.clone(),
            cache.clone(),
            audits,
            remote.clone(),
            gate,
            ConflictResolver::new(test_rules()),
            events.clone(),
            settings,
        );

        Fixture {
            store,
            log,
            cache,
            remote,
            coordinator,
            events,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(test_settings(), PolicyGate::new(PolicyConfig::default())).await
    }

    fn healthy_ctx() -> PolicyContext {
        PolicyContext {
            now: Utc::now(),
            battery_percent: 90,
            charging: false,
            network: NetworkClass::Wifi,
        }
    }

    fn op(id: &str, key: &str, priority: Priority) -> Operation {
        Operation::new(
            id,
            "update-progress",
            key,
            priority,
            format!("payload-of-{id}"),
            vec![],
            None,
            Utc::now(),
        )
    }

    fn remote_change(key: &str, value: &str, changed_at: DateTime<Utc>) -> RemoteChange {
        RemoteChange {
            entity_key: key.into(),
            kind: "update-progress".into(),
            value: value.into(),
            changed_at,
            role: None,
            checksum: Some(checksum_hex(value.as_bytes())),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success_counts_attempts() {
        let f = fixture().await;

        f.log.enqueue(op("op-1", "progress/u1", Priority::Medium))
            .await
            .unwrap();
        f.remote.fail_push_times("op-1", 3);

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.pushed, 1);
        assert_eq!(f.remote.push_attempts(), 4);
        assert!(f.log.get("op-1").await.is_none(), "completed op leaves the log");

        // The journal's final attempt record carries attempts == 4.
        let records: Vec<String> = sqlx::query_scalar("SELECT record FROM op_journal")
            .fetch_all(f.store.pool())
            .await
            .unwrap();
        assert!(records.iter().any(|r| r.contains("\"attempts\":4")));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_terminally_and_surfaces() {
        let settings = SyncSettings {
            max_attempts: 3,
            ..test_settings()
        };
        let f = fixture_with(settings, PolicyGate::new(PolicyConfig::default())).await;
        let mut events = f.events.subscribe();

        f.log.enqueue(op("op-1", "progress/u1", Priority::Medium))
            .await
            .unwrap();
        f.remote.fail_push_times("op-1", 10);

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::PartialFailure);
        assert_eq!(report.failed, 1);
        assert_eq!(f.remote.push_attempts(), 3);
        assert!(f.log.get("op-1").await.is_none(), "terminal op leaves the log");

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::OperationFailed { id, kind, reason } = event {
                assert_eq!(id, "op-1");
                assert_eq!(kind, "update-progress");
                assert!(!reason.is_empty());
                saw_failure = true;
            }
        }
        assert!(saw_failure, "operation.failed must reach the stream");
    }

    #[tokio::test]
    async fn test_pull_merges_and_recency_keeps_remote() {
        let f = fixture().await;

        // Local change is older than the remote one.
        let mut local = op("op-1", "progress/u1", Priority::Medium);
        local.changed_at = Utc::now() - chrono::Duration::hours(2);
        f.log.enqueue(local).await.unwrap();

        f.remote.enqueue_pull(
            vec![remote_change("progress/u1", "remote-wins", Utc::now())],
            "cursor-1",
        );

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.pulled, 1);
        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.conflicts_auto_resolved, 1);
        assert_eq!(report.pushed, 0, "superseded op is not transmitted");
        assert!(f.remote.acked().is_empty());
        assert!(f.log.get("op-1").await.is_none(), "superseded op completes");

        assert_eq!(f.cache.cursor().await.unwrap().as_deref(), Some("cursor-1"));
        assert_eq!(
            f.cache.get("progress/u1").await.unwrap().unwrap(),
            b"remote-wins"
        );
    }

    #[tokio::test]
    async fn test_role_precedence_keeps_local_and_pushes() {
        let f = fixture().await;

        // Authoritative local change, subordinate remote change with a
        // LATER timestamp: role precedence must still keep local.
        let mut local = op("op-1", "progress/u1", Priority::Medium);
        local.origin_role = Some("instructor".into());
        local.changed_at = Utc::now() - chrono::Duration::hours(2);
        f.log.enqueue(local).await.unwrap();

        let mut change = remote_change("progress/u1", "learner-value", Utc::now());
        change.role = Some("learner".into());
        f.remote.enqueue_pull(vec![change], "cursor-1");

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.conflicts_auto_resolved, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(f.remote.acked().len(), 1);
        // Local value restored over the merged remote one.
        assert_eq!(
            f.cache.get("progress/u1").await.unwrap().unwrap(),
            b"payload-of-op-1"
        );
    }

    #[tokio::test]
    async fn test_sensitive_kind_parks_conflicted() {
        let f = fixture().await;
        let mut events = f.events.subscribe();

        let mut local = op("op-1", "content/lesson-9", Priority::Medium);
        local.kind = "edit-content".into();
        f.log.enqueue(local).await.unwrap();

        let mut change = remote_change("content/lesson-9", "remote-edit", Utc::now());
        change.kind = "edit-content".into();
        f.remote.enqueue_pull(vec![change], "cursor-1");

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.manual_required, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(f.log.conflicted().await.len(), 1);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConflictDetected { conflict } = event {
                assert_eq!(conflict.entity_key, "content/lesson-9");
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    #[tokio::test]
    async fn test_fatal_pull_aborts_without_cursor_advance() {
        let f = fixture().await;

        f.log.enqueue(op("op-1", "progress/u1", Priority::Medium))
            .await
            .unwrap();
        f.remote.set_fatal_pulls(true);

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.outcome, SyncOutcome::Fatal);
        assert_eq!(f.cache.cursor().await.unwrap(), None);
        assert_eq!(f.remote.push_attempts(), 0, "no pushes after a fatal pull");

        let queued = f.log.get("op-1").await.unwrap();
        assert_eq!(queued.state, caravan_core::types::OperationState::Queued);
    }

    #[tokio::test]
    async fn test_circuit_breaker_suspends_pushes_but_pulls_continue() {
        let settings = SyncSettings {
            max_attempts: 1,
            breaker_threshold: 2,
            ..test_settings()
        };
        let f = fixture_with(settings, PolicyGate::new(PolicyConfig::default())).await;

        f.log.enqueue(op("op-1", "k/1", Priority::Medium)).await.unwrap();
        f.log.enqueue(op("op-2", "k/2", Priority::Medium)).await.unwrap();
        f.remote.set_outage(true);

        // Two terminal failures trip the breaker.
        let first = f
            .coordinator
            .run_session(10, 1, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();
        assert_eq!(first.failed, 2);
        assert!(f.coordinator.circuit_open().await);

        // Next session: pushes suspended, pulling still works.
        f.remote.set_outage(false);
        f.remote
            .enqueue_pull(vec![remote_change("k/9", "fresh", Utc::now())], "cursor-2");
        f.log.enqueue(op("op-3", "k/3", Priority::Medium)).await.unwrap();

        let attempts_before = f.remote.push_attempts();
        let second = f
            .coordinator
            .run_session(10, 1, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert!(second.push_suspended);
        assert_eq!(second.pulled, 1);
        assert_eq!(f.remote.push_attempts(), attempts_before);
        assert_eq!(f.cache.cursor().await.unwrap().as_deref(), Some("cursor-2"));
    }

    #[tokio::test]
    async fn test_policy_defers_low_but_pushes_critical() {
        // An all-day blackout window: only Critical passes the gate.
        let gate = PolicyGate::new(PolicyConfig {
            blackout_windows: vec![caravan_core::BlackoutWindow {
                name: "all-day".into(),
                start: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                end: chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            }],
            ..PolicyConfig::default()
        });
        let f = fixture_with(test_settings(), gate).await;

        f.log.enqueue(op("p1", "k/1", Priority::Critical)).await.unwrap();
        f.log.enqueue(op("p2", "k/2", Priority::Low)).await.unwrap();

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.remote.acked()[0].id, "p1");

        // Deferred, not dropped: still queued with a wakeup time.
        let deferred = f.log.get("p2").await.unwrap();
        assert_eq!(deferred.state, caravan_core::types::OperationState::Queued);
        assert!(deferred.scheduled_for.is_some());
    }

    #[tokio::test]
    async fn test_push_time_conflict_supersedes_local() {
        let f = fixture().await;

        let mut local = op("op-1", "progress/u1", Priority::Medium);
        local.changed_at = Utc::now() - chrono::Duration::hours(1);
        f.log.enqueue(local).await.unwrap();

        f.remote.conflict_on_push(
            "op-1",
            VersionedChange {
                value: "remote-newer".into(),
                changed_at: Utc::now(),
                role: None,
                checksum: None,
            },
        );

        let report = f
            .coordinator
            .run_session(10, 2, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.pushed, 0);
        assert!(f.remote.acked().is_empty());
        assert_eq!(
            f.cache.get("progress/u1").await.unwrap().unwrap(),
            b"remote-newer"
        );
    }

    #[tokio::test]
    async fn test_cancellation_reverts_in_flight_to_queued() {
        let settings = SyncSettings {
            max_attempts: 50,
            initial_backoff_ms: 200,
            ..test_settings()
        };
        let f = fixture_with(settings, PolicyGate::new(PolicyConfig::default())).await;

        f.log.enqueue(op("op-1", "k/1", Priority::Medium)).await.unwrap();
        f.remote.set_outage(true);

        let (handle, token) = CancelToken::new();
        let coordinator = f.coordinator.clone();
        let session =
            tokio::spawn(async move { coordinator.run_session(10, 1, healthy_ctx(), token).await });

        // Let the first attempt fail and the worker enter backoff.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let report = session.await.unwrap().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Cancelled);

        let reverted = f.log.get("op-1").await.unwrap();
        assert_eq!(reverted.state, caravan_core::types::OperationState::Queued);
        assert!(reverted.attempts >= 1);
    }

    #[tokio::test]
    async fn test_priority_order_is_preserved_in_push() {
        let f = fixture().await;

        f.log.enqueue(op("bg", "k/1", Priority::Background)).await.unwrap();
        f.log.enqueue(op("crit", "k/2", Priority::Critical)).await.unwrap();
        f.log.enqueue(op("med", "k/3", Priority::Medium)).await.unwrap();

        f.coordinator
            .run_session(10, 1, healthy_ctx(), CancelToken::never())
            .await
            .unwrap();

        let acked: Vec<String> = f.remote.acked().into_iter().map(|o| o.id).collect();
        assert_eq!(acked, vec!["crit", "med", "bg"]);
    }
}
