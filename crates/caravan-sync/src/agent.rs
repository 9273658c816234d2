//! # Sync Agent
//!
//! Facade over the whole sync core: the submission API, the event stream,
//! ambient condition reporting, and the background session loop.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  Host application                                                      │
//! │    │ enqueue / cancel / resolve_conflict / report_* / subscribe        │
//! │    ▼                                                                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        SyncAgent                                 │  │
//! │  │                                                                  │  │
//! │  │  • Validates and journals submissions (write-through to cache)  │  │
//! │  │  • Builds the PolicyContext from reported ambient conditions    │  │
//! │  │  • Runs sessions on: reconnect trigger, poll interval, manual   │  │
//! │  │  • Bridges store diagnostics onto the event stream              │  │
//! │  └───────┬──────────────────┬──────────────────┬───────────────────┘  │
//! │          ▼                  ▼                  ▼                       │
//! │  ┌──────────────┐  ┌─────────────────┐  ┌────────────────────────┐    │
//! │  │ OperationLog │  │ SyncCoordinator │  │ ConnectivityMonitor    │    │
//! │  └──────────────┘  └─────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  Local submissions NEVER fail due to network state: enqueue and        │
//! │  cache writes are local; only transmission and conflict steps can      │
//! │  produce externally visible failures (as events).                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};
use ts_rs::TS;
use uuid::Uuid;

use caravan_core::policy::{PolicyContext, PolicyGate};
use caravan_core::resolver::ConflictResolver;
use caravan_core::types::{
    AckOutcome, ConflictAudit, ConflictRule, ManualResolution, NetworkClass, Operation,
    OperationState, Priority, QueueSnapshot, Resolution,
};
use caravan_store::audit::ConflictAuditLog;
use caravan_store::cache::{CacheStore, SetOptions, StoreEvent};
use caravan_store::crypto::CacheCipher;
use caravan_store::oplog::OperationLog;
use caravan_store::pool::Store;

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::monitor::{degrade, ConnectivityMonitor, MonitorConfig, MonitorHandle, SyncTrigger};
use crate::remote::RemoteEndpoint;
use crate::session::{CancelHandle, CancelToken, SyncOutcome};

// =============================================================================
// Submission Types
// =============================================================================

/// One operation submission.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Caller-supplied id for idempotent dedup; generated when absent.
    pub id: Option<String>,

    /// Change-type tag (e.g. "update-progress").
    pub kind: String,

    /// Data key the change targets.
    pub entity_key: String,

    /// Priority tier.
    pub priority: Priority,

    /// Opaque serialized payload.
    pub payload: String,

    /// Operation ids that must complete first.
    pub depends_on: Vec<String>,

    /// Author role; falls back to the configured device role.
    pub origin_role: Option<String>,
}

impl EnqueueRequest {
    /// Minimal submission with defaults for the optional fields.
    pub fn new(
        kind: impl Into<String>,
        entity_key: impl Into<String>,
        priority: Priority,
        payload: impl Into<String>,
    ) -> Self {
        EnqueueRequest {
            id: None,
            kind: kind.into(),
            entity_key: entity_key.into(),
            priority,
            payload: payload.into(),
            depends_on: Vec::new(),
            origin_role: None,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Current agent status for external queries.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct AgentStatus {
    /// Current connectivity class.
    pub network: NetworkClass,

    /// Queue snapshot.
    pub queue: QueueSnapshot,

    /// Outcome of the most recent session, if any ran.
    pub last_outcome: Option<SyncOutcome>,

    /// When the most recent session finished.
    #[ts(as = "Option<String>")]
    pub last_sync: Option<DateTime<Utc>>,

    /// True while the circuit breaker is suspending pushes.
    pub circuit_open: bool,

    /// Last reported battery level.
    pub battery_percent: u8,

    /// Last reported charging state.
    pub charging: bool,
}

/// Ambient conditions reported by the host.
#[derive(Debug)]
struct AmbientState {
    battery_percent: u8,
    charging: bool,
    last_outcome: Option<SyncOutcome>,
    last_sync: Option<DateTime<Utc>>,
}

impl Default for AmbientState {
    fn default() -> Self {
        AmbientState {
            // Optimistic until the host reports: a fresh device should not
            // start throttled.
            battery_percent: 100,
            charging: false,
            last_outcome: None,
            last_sync: None,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder wiring constructor-injected services into a SyncAgent.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    store: Option<Store>,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    cipher: Option<CacheCipher>,
}

impl SyncAgentBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            store: None,
            remote: None,
            cipher: None,
        }
    }

    /// Sets the backing store.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the remote endpoint.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteEndpoint>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the cache cipher for sealed entries.
    pub fn with_cipher(mut self, cipher: CacheCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Opens the durable services and assembles the agent.
    pub async fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Store required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote endpoint required".into()))?;

        let log = OperationLog::open(store.pool().clone()).await?;
        let cache = CacheStore::open(
            store.pool().clone(),
            self.config.cache.to_cache_config(),
            self.cipher,
        )
        .await?;
        let audits = ConflictAuditLog::new(store.pool().clone());
        let events = EventBus::default();

        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let monitor = ConnectivityMonitor::spawn(
            MonitorConfig {
                debounce: Duration::from_millis(self.config.sync.debounce_ms),
            },
            trigger_tx.clone(),
        );

        let coordinator = SyncCoordinator::new(
            log.clone(),
            cache.clone(),
            audits.clone(),
            remote,
            PolicyGate::new(self.config.policy.clone()),
            ConflictResolver::new(self.config.resolver.clone()),
            events.clone(),
            self.config.sync.clone(),
        );

        Ok(SyncAgent {
            config: Arc::new(self.config),
            log,
            cache,
            audits,
            coordinator,
            events,
            monitor,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            ambient: Arc::new(RwLock::new(AmbientState::default())),
            active_session: Arc::new(Mutex::new(None)),
            shutdown_tx: None,
        })
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// The sync core's single entry point for host applications.
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    log: OperationLog,
    cache: CacheStore,
    audits: ConflictAuditLog,
    coordinator: SyncCoordinator,
    events: EventBus,
    monitor: MonitorHandle,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    trigger_rx: Option<mpsc::Receiver<SyncTrigger>>,
    ambient: Arc<RwLock<AmbientState>>,
    active_session: Arc<Mutex<Option<CancelHandle>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SyncAgent {
    /// Starts the background loop: poll interval, reconnect triggers, and
    /// the store-diagnostics bridge.
    pub async fn start(&mut self) -> SyncResult<()> {
        let trigger_rx = self
            .trigger_rx
            .take()
            .ok_or(SyncError::ShuttingDown)?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        // Bridge cache corruption diagnostics onto the host event stream.
        let mut store_events = self.cache.subscribe();
        let bus = self.events.clone();
        tokio::spawn(async move {
            while let Ok(event) = store_events.recv().await {
                match event {
                    StoreEvent::CorruptionDetected { key, reason } => {
                        bus.emit(SyncEvent::CorruptionDetected { key, reason });
                    }
                }
            }
        });

        let runner = SessionRunner {
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            monitor: self.monitor.clone(),
            ambient: self.ambient.clone(),
            active_session: self.active_session.clone(),
        };
        tokio::spawn(runner.run(trigger_rx, shutdown_rx));

        info!(device_id = %self.config.device.id, "Sync agent started");
        Ok(())
    }

    /// Stops the background loop and cancels any in-flight session.
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync agent");

        self.cancel_active_session().await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        let _ = self.monitor.shutdown().await;

        info!("Sync agent stopped");
    }

    // =========================================================================
    // Submission API
    // =========================================================================

    /// Enqueues a local change. Always succeeds locally regardless of
    /// network state; the payload is also write-through cached under the
    /// entity key so it has a durable readable backing entry.
    pub async fn enqueue(&self, request: EnqueueRequest) -> SyncResult<String> {
        let id = request
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let role = request
            .origin_role
            .or_else(|| self.config.device.role.clone());

        let op = Operation::new(
            id,
            request.kind.clone(),
            request.entity_key.clone(),
            request.priority,
            request.payload.clone(),
            request.depends_on,
            role,
            Utc::now(),
        );

        let id = self.log.enqueue(op).await?;

        let encrypt = self
            .config
            .cache
            .encrypted_kinds
            .iter()
            .any(|k| k == &request.kind);
        self.cache
            .set(
                &request.entity_key,
                request.payload.as_bytes(),
                SetOptions {
                    priority: request.priority,
                    encrypt,
                    ..SetOptions::default()
                },
            )
            .await?;

        self.emit_queue_changed().await;
        debug!(id = %id, kind = %request.kind, "Operation enqueued");
        Ok(id)
    }

    /// Cancels a still-queued operation. Returns false once it has been
    /// admitted or later.
    pub async fn cancel(&self, id: &str) -> SyncResult<bool> {
        let cancelled = self.log.cancel(id).await?;
        if cancelled {
            self.emit_queue_changed().await;
        }
        Ok(cancelled)
    }

    /// Applies a host decision to a conflict that was parked
    /// `ManualRequired`. `KeepLocal`/`Merged` re-enter the queue;
    /// `KeepRemote` completes the operation as superseded.
    pub async fn resolve_conflict(
        &self,
        operation_id: &str,
        resolution: ManualResolution,
    ) -> SyncResult<()> {
        let op = self
            .log
            .get(operation_id)
            .await
            .ok_or_else(|| SyncError::Store(caravan_store::StoreError::not_found(
                "Operation",
                operation_id,
            )))?;
        if op.state != OperationState::Conflicted {
            return Err(SyncError::InvalidState {
                id: operation_id.to_string(),
                state: op.state.to_string(),
                attempted: "resolve_conflict".to_string(),
            });
        }

        let cached_remote = self
            .cache
            .get(&op.entity_key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        let (resolved, resolved_value) = match &resolution {
            ManualResolution::KeepRemote => {
                self.log.ack(operation_id, AckOutcome::Completed).await?;
                (Resolution::KeepRemote, cached_remote.clone())
            }
            ManualResolution::KeepLocal => {
                self.log.reopen_conflicted(operation_id, None).await?;
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
                (Resolution::KeepLocal, op.payload.clone())
            }
            ManualResolution::Merged(value) => {
                self.log
                    .reopen_conflicted(operation_id, Some(value.clone()))
                    .await?;
                self.cache
                    .set(
                        &op.entity_key,
                        value.as_bytes(),
                        SetOptions {
                            priority: op.priority,
                            ..SetOptions::default()
                        },
                    )
                    .await?;
                (Resolution::Merged, value.clone())
            }
        };

        let audit = ConflictAudit {
            id: Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            entity_key: op.entity_key.clone(),
            rule: ConflictRule::Manual,
            resolution: resolved,
            local_value: op.payload.clone(),
            remote_value: cached_remote,
            resolved_value: Some(resolved_value),
            audited_at: Utc::now(),
        };
        self.audits.append(&audit).await?;

        self.events.emit(SyncEvent::ConflictResolved {
            operation_id: operation_id.to_string(),
            entity_key: op.entity_key,
            rule: ConflictRule::Manual,
            resolution: resolved,
        });
        self.emit_queue_changed().await;
        Ok(())
    }

    // =========================================================================
    // Ambient Reporting
    // =========================================================================

    /// The host reports a connectivity transition.
    pub async fn report_network(&self, state: NetworkClass) -> SyncResult<()> {
        self.monitor.report(state).await
    }

    /// The host reports battery conditions.
    pub async fn report_battery(&self, battery_percent: u8, charging: bool) {
        let mut ambient = self.ambient.write().await;
        ambient.battery_percent = battery_percent.min(100);
        ambient.charging = charging;
    }

    // =========================================================================
    // Status & Control
    // =========================================================================

    /// Current agent status.
    pub async fn status(&self) -> AgentStatus {
        let ambient = self.ambient.read().await;
        AgentStatus {
            network: self.monitor.current_state(),
            queue: self.log.peek_status().await,
            last_outcome: ambient.last_outcome,
            last_sync: ambient.last_sync,
            circuit_open: self.coordinator.circuit_open().await,
            battery_percent: ambient.battery_percent,
            charging: ambient.charging,
        }
    }

    /// Subscribes to the status/event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Requests a session as soon as the loop picks the trigger up.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.trigger_tx
            .send(SyncTrigger::Manual)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Cancels the in-flight session, if any (e.g. host backgrounding).
    /// In-flight operations revert to `Queued`.
    pub async fn cancel_active_session(&self) {
        if let Some(handle) = self.active_session.lock().await.take() {
            handle.cancel();
        }
    }

    /// Reclaims expired and cold cache entries.
    pub async fn compact_cache(&self) -> SyncResult<caravan_store::CompactReport> {
        Ok(self.cache.compact().await?)
    }

    async fn emit_queue_changed(&self) {
        let snapshot = self.log.peek_status().await;
        self.events.emit(SyncEvent::QueueChanged { snapshot });
    }
}

// =============================================================================
// Session Runner
// =============================================================================

/// The background loop: reacts to triggers and the poll interval.
struct SessionRunner {
    config: Arc<SyncConfig>,
    coordinator: SyncCoordinator,
    monitor: MonitorHandle,
    ambient: Arc<RwLock<AmbientState>>,
    active_session: Arc<Mutex<Option<CancelHandle>>>,
}

impl SessionRunner {
    async fn run(
        self,
        mut trigger_rx: mpsc::Receiver<SyncTrigger>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sync.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_run(SyncTrigger::Interval).await;
                }

                Some(trigger) = trigger_rx.recv() => {
                    self.maybe_run(trigger).await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Session runner shutting down");
                    break;
                }
            }
        }

        info!("Session runner stopped");
    }

    /// Runs one session unless offline or one is already in flight.
    async fn maybe_run(&self, trigger: SyncTrigger) {
        let network = self.monitor.current_state();
        if !network.is_connected() {
            debug!(?trigger, "Offline, skipping session");
            return;
        }

        let token = {
            let mut active = self.active_session.lock().await;
            if active.is_some() {
                debug!(?trigger, "Session already running, skipping");
                return;
            }
            let (handle, token) = CancelToken::new();
            *active = Some(handle);
            token
        };

        let (battery_percent, charging) = {
            let ambient = self.ambient.read().await;
            (ambient.battery_percent, ambient.charging)
        };

        let ctx = PolicyContext {
            now: Utc::now(),
            battery_percent,
            charging,
            network,
        };
        let sizing = degrade(
            self.config.sync.max_batch,
            self.config.sync.max_concurrency,
            network,
            battery_percent,
            charging,
            self.config.policy.critical_battery_percent,
        );

        debug!(?trigger, batch = sizing.batch, concurrency = sizing.concurrency, "Running session");
        let result = self
            .coordinator
            .run_session(sizing.batch, sizing.concurrency, ctx, token)
            .await;

        *self.active_session.lock().await = None;

        match result {
            Ok(report) => {
                let mut ambient = self.ambient.write().await;
                ambient.last_outcome = Some(report.outcome);
                ambient.last_sync = Some(report.finished_at);
            }
            Err(e) => {
                error!(error = %e, "Session failed");
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ScriptedRemote;
    use caravan_store::pool::StoreConfig;

    async fn agent() -> (SyncAgent, Arc<ScriptedRemote>) {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new());
        let agent = SyncAgentBuilder::new(SyncConfig::default())
            .with_store(store)
            .with_remote(remote.clone())
            .build()
            .await
            .unwrap();
        (agent, remote)
    }

    #[tokio::test]
    async fn test_enqueue_succeeds_offline_and_write_throughs_cache() {
        let (agent, _remote) = agent().await;

        // No network reported: the agent is offline, enqueue still works.
        let id = agent
            .enqueue(EnqueueRequest::new(
                "update-progress",
                "progress/u1",
                Priority::High,
                "{\"lesson\":7}",
            ))
            .await
            .unwrap();

        let status = agent.status().await;
        assert_eq!(status.network, NetworkClass::Offline);
        assert_eq!(status.queue.queued, 1);

        // The payload has a durable readable backing entry.
        assert_eq!(
            agent.cache.get("progress/u1").await.unwrap().unwrap(),
            b"{\"lesson\":7}"
        );

        // Same id again: idempotent merge, still one entry.
        let again = agent
            .enqueue(EnqueueRequest {
                id: Some(id.clone()),
                ..EnqueueRequest::new("update-progress", "progress/u1", Priority::High, "{}")
            })
            .await
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(agent.status().await.queue.queued, 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_malformed_submission() {
        let (agent, _remote) = agent().await;

        let err = agent
            .enqueue(EnqueueRequest::new("", "progress/u1", Priority::Low, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(caravan_store::StoreError::Validation(_))
        ));
        assert_eq!(agent.status().await.queue.total, 0);
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let (agent, _remote) = agent().await;

        let id = agent
            .enqueue(EnqueueRequest::new(
                "update-progress",
                "progress/u1",
                Priority::Low,
                "{}",
            ))
            .await
            .unwrap();

        assert!(agent.cancel(&id).await.unwrap());
        assert!(!agent.cancel(&id).await.unwrap(), "already gone");
        assert_eq!(agent.status().await.queue.total, 0);
    }

    #[tokio::test]
    async fn test_manual_resolution_merged_requeues_with_new_payload() {
        let (agent, _remote) = agent().await;

        let id = agent
            .enqueue(EnqueueRequest::new(
                "update-progress",
                "progress/u1",
                Priority::Medium,
                "local",
            ))
            .await
            .unwrap();
        agent.log.ack(&id, AckOutcome::Conflicted).await.unwrap();

        agent
            .resolve_conflict(&id, ManualResolution::Merged("merged".into()))
            .await
            .unwrap();

        let op = agent.log.get(&id).await.unwrap();
        assert_eq!(op.state, OperationState::Queued);
        assert_eq!(op.payload, "merged");
        assert_eq!(
            agent.cache.get("progress/u1").await.unwrap().unwrap(),
            b"merged"
        );
        assert_eq!(agent.audits.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_resolution_requires_conflicted_state() {
        let (agent, _remote) = agent().await;

        let id = agent
            .enqueue(EnqueueRequest::new(
                "update-progress",
                "progress/u1",
                Priority::Medium,
                "local",
            ))
            .await
            .unwrap();

        let err = agent
            .resolve_conflict(&id, ManualResolution::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_device_role_is_default_origin_role() {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new());
        let mut config = SyncConfig::default();
        config.device.role = Some("instructor".into());

        let agent = SyncAgentBuilder::new(config)
            .with_store(store)
            .with_remote(remote)
            .build()
            .await
            .unwrap();

        let id = agent
            .enqueue(EnqueueRequest::new(
                "update-progress",
                "progress/u1",
                Priority::Medium,
                "{}",
            ))
            .await
            .unwrap();

        let op = agent.log.get(&id).await.unwrap();
        assert_eq!(op.origin_role.as_deref(), Some("instructor"));
    }
}
