//! # Connectivity Monitor
//!
//! Observes network/battery transitions reported by the host and triggers
//! sync sessions with appropriate throttling.
//!
//! ## Debounce
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Reconnect Debounce                                   │
//! │                                                                         │
//! │  offline ──► wifi        start debounce timer                          │
//! │  wifi ──► offline        cancel timer (flapping connection)            │
//! │  offline ──► cellular    restart timer                                 │
//! │  (stable for debounce)   fire SyncTrigger::Reconnected                 │
//! │                                                                         │
//! │  A connection that flaps faster than the debounce interval never       │
//! │  triggers a session.                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Degradation
//! Under cellular or low-battery conditions sync aggressiveness (batch
//! size, worker concurrency) is scaled down - never to zero.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use caravan_core::types::NetworkClass;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Triggers
// =============================================================================

/// Why the agent should run a session now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity returned after an offline stretch (debounced).
    Reconnected,
    /// Background poll interval elapsed.
    Interval,
    /// The host asked explicitly.
    Manual,
}

// =============================================================================
// Configuration
// =============================================================================

/// Connectivity Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long a connection must stay up before triggering a session.
    pub debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            debounce: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Monitor Handle
// =============================================================================

/// Handle for feeding transitions and reading the current state.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    report_tx: mpsc::Sender<NetworkClass>,
    state_rx: watch::Receiver<NetworkClass>,
    shutdown_tx: mpsc::Sender<()>,
}

impl MonitorHandle {
    /// Reports a connectivity transition observed by the host.
    pub async fn report(&self, state: NetworkClass) -> SyncResult<()> {
        self.report_tx
            .send(state)
            .await
            .map_err(|_| SyncError::ChannelError("Monitor channel closed".into()))
    }

    /// Current connectivity class.
    pub fn current_state(&self) -> NetworkClass {
        *self.state_rx.borrow()
    }

    /// Watch receiver for transition subscribers.
    pub fn subscribe(&self) -> watch::Receiver<NetworkClass> {
        self.state_rx.clone()
    }

    /// Triggers graceful shutdown of the monitor task.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Monitor already stopped".into()))
    }
}

// =============================================================================
// Connectivity Monitor
// =============================================================================

/// The transition watcher task.
pub struct ConnectivityMonitor {
    config: MonitorConfig,
    report_rx: mpsc::Receiver<NetworkClass>,
    state_tx: watch::Sender<NetworkClass>,
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ConnectivityMonitor {
    /// Creates the monitor and spawns its background task. The initial
    /// state is `Offline` until the host reports otherwise.
    pub fn spawn(config: MonitorConfig, triggers: mpsc::Sender<SyncTrigger>) -> MonitorHandle {
        let (report_tx, report_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(NetworkClass::Offline);

        let monitor = ConnectivityMonitor {
            config,
            report_rx,
            state_tx,
            triggers,
            shutdown_rx,
        };
        tokio::spawn(monitor.run());

        MonitorHandle {
            report_tx,
            state_rx,
            shutdown_tx,
        }
    }

    /// Main monitor loop.
    async fn run(mut self) {
        info!("Connectivity monitor starting");

        // Deadline is set while a reconnect is waiting out the debounce.
        let mut deadline: Option<Instant> = None;

        loop {
            let debounce_wait = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(new_state) = self.report_rx.recv() => {
                    let previous = *self.state_tx.borrow();
                    if new_state == previous {
                        continue;
                    }

                    debug!(from = %previous, to = %new_state, "Connectivity transition");
                    let _ = self.state_tx.send(new_state);

                    if previous == NetworkClass::Offline && new_state.is_connected() {
                        deadline = Some(Instant::now() + self.config.debounce);
                    } else if new_state == NetworkClass::Offline {
                        // Flapped back down before the debounce elapsed.
                        deadline = None;
                    }
                }

                _ = debounce_wait => {
                    deadline = None;
                    info!("Connection stable after debounce, triggering sync");
                    if self.triggers.send(SyncTrigger::Reconnected).await.is_err() {
                        debug!("Trigger receiver dropped, stopping monitor");
                        break;
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Connectivity monitor shutting down");
                    break;
                }
            }
        }

        info!("Connectivity monitor stopped");
    }
}

// =============================================================================
// Degradation
// =============================================================================

/// Effective session sizing after connectivity/battery degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAggressiveness {
    pub batch: usize,
    pub concurrency: usize,
}

/// Scales batch size and worker concurrency down under cellular or
/// low-battery conditions. Never returns zero: degraded sync still syncs.
pub fn degrade(
    base_batch: usize,
    base_concurrency: usize,
    network: NetworkClass,
    battery_percent: u8,
    charging: bool,
    low_battery_threshold: u8,
) -> SyncAggressiveness {
    let mut batch = base_batch;
    let mut concurrency = base_concurrency;

    if network == NetworkClass::Cellular {
        batch /= 2;
        concurrency /= 2;
    }

    // Twice the critical threshold counts as "low" for degradation; below
    // the critical threshold itself the Policy Gate defers non-critical
    // work entirely.
    if !charging && battery_percent < low_battery_threshold.saturating_mul(2) {
        batch /= 2;
        concurrency /= 2;
    }

    SyncAggressiveness {
        batch: batch.max(1),
        concurrency: concurrency.max(1),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
