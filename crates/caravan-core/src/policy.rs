//! # Policy Gate
//!
//! Decides whether a ready operation may execute *now*, based on time-window
//! policy, battery, and network quality. Pure decision functions: the clock,
//! battery level, and network class are all inputs.
//!
//! ## Admission Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Policy Gate Decision                              │
//! │                                                                         │
//! │  Operation priority == Critical?                                       │
//! │       │ yes                                                             │
//! │       └──► ADMIT (bypasses every policy deferral; still subject to     │
//! │            actual network availability at transmission time)           │
//! │       │ no                                                              │
//! │       ▼                                                                 │
//! │  Inside a blackout window?  ──► DEFER until the window ends            │
//! │  Battery below threshold    ──► DEFER for the battery recheck          │
//! │  (and not charging)?             interval                              │
//! │  Network offline?           ──► DEFER for the offline recheck          │
//! │                                  interval                              │
//! │       │ none of the above                                               │
//! │       ▼                                                                 │
//! │  ADMIT                                                                  │
//! │                                                                         │
//! │  Deferrals NEVER drop an operation: the coordinator stamps             │
//! │  `scheduled_for` with the computed next-admissible time and the        │
//! │  operation stays Queued.                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Blackout Windows
//! Named time-of-day ranges (quiet hours, observance periods) during which
//! only `Critical` operations are admitted. A window may wrap midnight
//! (`22:00 → 06:00`). Windows are evaluated in the deployment's local clock,
//! supplied as a fixed UTC offset in the policy configuration; any deployment
//! supplies its own window table without changing the gate's logic.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NetworkClass, Operation, Priority};

// =============================================================================
// Configuration
// =============================================================================

/// A named time-of-day range during which non-critical work is deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    /// Deployment-supplied label, surfaced in deferral reasons.
    pub name: String,

    /// Inclusive start of the window (local time-of-day).
    pub start: NaiveTime,

    /// Exclusive end of the window. A window with `end < start` wraps
    /// midnight.
    pub end: NaiveTime,
}

impl BlackoutWindow {
    /// True when the given local time-of-day falls inside the window.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Wraps midnight: [start, 24:00) ∪ [00:00, end)
            t >= self.start || t < self.end
        }
    }
}

/// Policy Gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Named blackout windows, evaluated in the local clock.
    #[serde(default)]
    pub blackout_windows: Vec<BlackoutWindow>,

    /// Battery percentage below which non-critical work is deferred while
    /// discharging.
    #[serde(default = "default_critical_battery")]
    pub critical_battery_percent: u8,

    /// How long a battery deferral lasts before re-evaluation (seconds).
    #[serde(default = "default_battery_recheck")]
    pub battery_recheck_secs: u64,

    /// How long an offline deferral lasts before re-evaluation (seconds).
    #[serde(default = "default_offline_recheck")]
    pub offline_recheck_secs: u64,

    /// Fixed offset (minutes east of UTC) used to evaluate the window table.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_critical_battery() -> u8 {
    15
}

fn default_battery_recheck() -> u64 {
    900 // 15 minutes
}

fn default_offline_recheck() -> u64 {
    300 // 5 minutes
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            blackout_windows: Vec::new(),
            critical_battery_percent: default_critical_battery(),
            battery_recheck_secs: default_battery_recheck(),
            offline_recheck_secs: default_offline_recheck(),
            utc_offset_minutes: 0,
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// Snapshot of ambient conditions at decision time. Built by the
/// orchestrator; this crate never reads the clock or the battery itself.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext {
    /// Current instant.
    pub now: DateTime<Utc>,

    /// Battery charge, 0-100.
    pub battery_percent: u8,

    /// True while on external power (low battery is then ignored).
    pub charging: bool,

    /// Current connectivity class.
    pub network: NetworkClass,
}

// =============================================================================
// Decision
// =============================================================================

/// Why a non-critical operation was deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum DeferReason {
    /// Inside the named blackout window.
    Blackout { window: String },
    /// Below the critical battery threshold while discharging.
    LowBattery,
    /// No network available.
    Offline,
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferReason::Blackout { window } => write!(f, "blackout window '{}'", window),
            DeferReason::LowBattery => write!(f, "low battery"),
            DeferReason::Offline => write!(f, "offline"),
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The operation may execute now.
    Admit,
    /// Deferred: not before `until`. `reason` is the binding constraint
    /// (the one that clears last).
    Defer {
        reason: DeferReason,
        until: DateTime<Utc>,
    },
}

// =============================================================================
// Policy Gate
// =============================================================================

/// The admission decision function.
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    config: PolicyConfig,
}

impl PolicyGate {
    /// Creates a gate with the given configuration.
    pub fn new(config: PolicyConfig) -> Self {
        PolicyGate { config }
    }

    /// Full admission decision for one operation.
    pub fn evaluate(&self, op: &Operation, ctx: &PolicyContext) -> Admission {
        // Critical work is never deferred by policy.
        if op.priority == Priority::Critical {
            return Admission::Admit;
        }

        let mut binding: Option<(DeferReason, DateTime<Utc>)> = None;
        let mut consider = |reason: DeferReason, until: DateTime<Utc>| {
            let replace = match &binding {
                Some((_, existing)) => until > *existing,
                None => true,
            };
            if replace {
                binding = Some((reason, until));
            }
        };

        if let Some(window) = self.active_window(ctx.now) {
            let until = self.window_end_instant(&window, ctx.now);
            consider(
                DeferReason::Blackout {
                    window: window.name.clone(),
                },
                until,
            );
        }

        if !ctx.charging && ctx.battery_percent < self.config.critical_battery_percent {
            consider(
                DeferReason::LowBattery,
                ctx.now + Duration::seconds(self.config.battery_recheck_secs as i64),
            );
        }

        if ctx.network == NetworkClass::Offline {
            consider(
                DeferReason::Offline,
                ctx.now + Duration::seconds(self.config.offline_recheck_secs as i64),
            );
        }

        match binding {
            Some((reason, until)) => Admission::Defer { reason, until },
            None => Admission::Admit,
        }
    }

    /// Convenience predicate over [`PolicyGate::evaluate`].
    pub fn is_admissible(&self, op: &Operation, ctx: &PolicyContext) -> bool {
        matches!(self.evaluate(op, ctx), Admission::Admit)
    }

    /// The earliest instant the operation could be admitted. Returns
    /// `ctx.now` when the operation is admissible immediately.
    pub fn next_admissible_time(&self, op: &Operation, ctx: &PolicyContext) -> DateTime<Utc> {
        match self.evaluate(op, ctx) {
            Admission::Admit => ctx.now,
            Admission::Defer { until, .. } => until,
        }
    }

    /// The first configured window containing the current local time.
    fn active_window(&self, now: DateTime<Utc>) -> Option<BlackoutWindow> {
        let local = self.local_time(now);
        self.config
            .blackout_windows
            .iter()
            .find(|w| w.contains(local))
            .cloned()
    }

    /// Converts an instant to the deployment's local time-of-day.
    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        (now + Duration::minutes(self.config.utc_offset_minutes as i64)).time()
    }

    /// The instant at which an active window releases, in UTC.
    fn window_end_instant(&self, window: &BlackoutWindow, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = Duration::minutes(self.config.utc_offset_minutes as i64);
        let local = (now + offset).naive_utc();

        // If today's end-of-window already passed in local terms, the window
        // wraps midnight and releases tomorrow.
        let mut end = local.date().and_time(window.end);
        if end <= local {
            end = end + Duration::days(1);
        }

        (end - offset).and_utc()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gate_with_window(start: (u32, u32), end: (u32, u32)) -> PolicyGate {
        PolicyGate::new(PolicyConfig {
            blackout_windows: vec![BlackoutWindow {
                name: "quiet-hours".into(),
                start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
                end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            }],
            ..PolicyConfig::default()
        })
    }

    fn healthy_ctx(now: DateTime<Utc>) -> PolicyContext {
        PolicyContext {
            now,
            battery_percent: 80,
            charging: false,
            network: NetworkClass::Wifi,
        }
    }

    fn op(priority: Priority) -> Operation {
        Operation::new(
            "op-1",
            "update-progress",
            "progress/user-1",
            priority,
            "{}",
            vec![],
            None,
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_critical_bypasses_blackout_window() {
        let gate = gate_with_window((12, 0), (14, 0));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();
        let ctx = healthy_ctx(now);

        let p1 = op(Priority::Critical);
        let p2 = op(Priority::Low);

        assert!(gate.is_admissible(&p1, &ctx));
        assert!(!gate.is_admissible(&p2, &ctx));

        // The deferred operation resumes exactly when the window ends.
        let next = gate.next_admissible_time(&p2, &ctx);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap());
        // The critical one is admissible right now.
        assert_eq!(gate.next_admissible_time(&p1, &ctx), now);
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let gate = gate_with_window((22, 0), (6, 0));

        // 23:30 is inside the window; release is 06:00 the next day.
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap();
        let ctx = healthy_ctx(late);
        match gate.evaluate(&op(Priority::Medium), &ctx) {
            Admission::Defer { until, .. } => {
                assert_eq!(until, Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap());
            }
            Admission::Admit => panic!("expected deferral inside wrapped window"),
        }

        // 05:00 is the past-midnight half; release is 06:00 the same day.
        let early = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let ctx = healthy_ctx(early);
        match gate.evaluate(&op(Priority::Medium), &ctx) {
            Admission::Defer { until, .. } => {
                assert_eq!(until, Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap());
            }
            Admission::Admit => panic!("expected deferral inside wrapped window"),
        }

        // 12:00 is outside.
        let noon = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        assert!(gate.is_admissible(&op(Priority::Medium), &healthy_ctx(noon)));
    }

    #[test]
    fn test_low_battery_defers_unless_charging() {
        let gate = PolicyGate::new(PolicyConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();

        let drained = PolicyContext {
            now,
            battery_percent: 5,
            charging: false,
            network: NetworkClass::Wifi,
        };
        match gate.evaluate(&op(Priority::Medium), &drained) {
            Admission::Defer { reason, until } => {
                assert_eq!(reason, DeferReason::LowBattery);
                assert_eq!(until, now + Duration::seconds(900));
            }
            Admission::Admit => panic!("expected low-battery deferral"),
        }

        let charging = PolicyContext {
            charging: true,
            ..drained
        };
        assert!(gate.is_admissible(&op(Priority::Medium), &charging));

        // Critical still admits on a drained battery.
        assert!(gate.is_admissible(&op(Priority::Critical), &drained));
    }

    #[test]
    fn test_offline_defers_non_critical() {
        let gate = PolicyGate::new(PolicyConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let ctx = PolicyContext {
            now,
            battery_percent: 90,
            charging: false,
            network: NetworkClass::Offline,
        };

        match gate.evaluate(&op(Priority::Background), &ctx) {
            Admission::Defer { reason, until } => {
                assert_eq!(reason, DeferReason::Offline);
                assert_eq!(until, now + Duration::seconds(300));
            }
            Admission::Admit => panic!("expected offline deferral"),
        }
    }

    #[test]
    fn test_binding_constraint_is_the_latest() {
        // Inside a window AND offline: the deferral lasts until whichever
        // clears last.
        let gate = gate_with_window((9, 0), (18, 0));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let ctx = PolicyContext {
            now,
            battery_percent: 90,
            charging: false,
            network: NetworkClass::Offline,
        };

        match gate.evaluate(&op(Priority::Medium), &ctx) {
            Admission::Defer { reason, until } => {
                // Window releases at 18:00, offline recheck at 10:05.
                assert_eq!(until, Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap());
                assert!(matches!(reason, DeferReason::Blackout { .. }));
            }
            Admission::Admit => panic!("expected deferral"),
        }
    }

    #[test]
    fn test_utc_offset_shifts_window_evaluation() {
        // Window 12:00-14:00 local, at UTC+5 → 07:00-09:00 UTC.
        let gate = PolicyGate::new(PolicyConfig {
            blackout_windows: vec![BlackoutWindow {
                name: "midday".into(),
                start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            }],
            utc_offset_minutes: 300,
            ..PolicyConfig::default()
        });

        let inside = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        assert!(!gate.is_admissible(&op(Priority::Medium), &healthy_ctx(inside)));

        let outside = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        assert!(gate.is_admissible(&op(Priority::Medium), &healthy_ctx(outside)));
    }
}
