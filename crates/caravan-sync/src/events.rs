//! # Status/Event Stream
//!
//! The core never renders UI. Everything a host needs to present - queue
//! movement, session lifecycle, conflicts, corruption - flows through this
//! broadcast stream with enough detail (kind, id, reason) for a meaningful
//! message.
//!
//! ## Event Catalog
//! ```text
//! queue.changed        → QueueChanged        (snapshot after every mutation)
//! sync.started         → SyncStarted
//! sync.completed       → SyncCompleted       (outcome + counters)
//! conflict.detected    → ConflictDetected    (full conflict, both versions)
//! conflict.resolved    → ConflictResolved    (rule fired + resolution)
//! corruption.detected  → CorruptionDetected  (cache key + reason)
//! operation.failed     → OperationFailed     (retries exhausted)
//! ```

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use ts_rs::TS;

use caravan_core::types::{Conflict, ConflictRule, QueueSnapshot, Resolution};

use crate::session::SessionReport;

// =============================================================================
// Events
// =============================================================================

/// One event on the host-facing stream.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The operation log changed (enqueue, ack, cancel, deferral).
    QueueChanged { snapshot: QueueSnapshot },

    /// A session began.
    SyncStarted { session_id: String },

    /// A session finished; the report carries outcome and counters.
    SyncCompleted { report: SessionReport },

    /// A local/remote divergence was detected on an entity key.
    ConflictDetected { conflict: Conflict },

    /// The resolver (or a manual decision) settled a conflict.
    ConflictResolved {
        operation_id: String,
        entity_key: String,
        rule: ConflictRule,
        resolution: Resolution,
    },

    /// A cache entry failed integrity validation and was quarantined.
    CorruptionDetected { key: String, reason: String },

    /// An operation exhausted its retries or hit a non-retryable failure.
    OperationFailed {
        id: String,
        kind: String,
        reason: String,
    },
}

impl SyncEvent {
    /// Stable event name, mirroring the catalog above.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::QueueChanged { .. } => "queue.changed",
            SyncEvent::SyncStarted { .. } => "sync.started",
            SyncEvent::SyncCompleted { .. } => "sync.completed",
            SyncEvent::ConflictDetected { .. } => "conflict.detected",
            SyncEvent::ConflictResolved { .. } => "conflict.resolved",
            SyncEvent::CorruptionDetected { .. } => "corruption.detected",
            SyncEvent::OperationFailed { .. } => "operation.failed",
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Broadcast fan-out to any number of host subscribers.
///
/// Emitting with no subscribers is fine - events are dropped, not errors.
/// A slow subscriber that lags past the channel capacity loses the oldest
/// events (tokio broadcast semantics), never blocks the core.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus with the given buffered capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Subscribes; the receiver sees events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers.
    pub fn emit(&self, event: SyncEvent) {
        debug!(event = event.name(), "Emitting sync event");
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers (diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::SyncStarted {
            session_id: "s-1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::CorruptionDetected {
            key: "progress/u1".into(),
            reason: "checksum mismatch".into(),
        });

        match rx.recv().await.unwrap() {
            SyncEvent::CorruptionDetected { key, .. } => assert_eq!(key, "progress/u1"),
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_event_names_match_catalog() {
        let event = SyncEvent::QueueChanged {
            snapshot: QueueSnapshot::default(),
        };
        assert_eq!(event.name(), "queue.changed");
    }
}
