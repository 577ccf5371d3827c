//! Edge-triggered hard-limit alerts.
//!
//! Each alert kind is a small state machine stored in the runtime status:
//!
//! ```text
//! inactive ──[breach]──▶ active ──[recovered]──▶ inactive
//!                         │  ▲
//!                         └──┘ breach persists: reminder at most once per cooldown
//! ```
//!
//! Breach compares against the raw limit; recovery requires crossing back
//! past the limit plus a hysteresis margin, so the caller decides both edges.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::events::{AuditEvent, EventLog};
use crate::notify::Notifier;
use crate::state::RuntimeStatus;

// ---------------------------------------------------------------------------
// Alert kinds & state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ReservoirCutoff,
    TempHardLow,
    TempHardHigh,
    HumHardLow,
    HumHardHigh,
    WaterTempLow,
    WaterTempHigh,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::ReservoirCutoff => "reservoir_cutoff",
            AlertKind::TempHardLow => "temp_hard_low",
            AlertKind::TempHardHigh => "temp_hard_high",
            AlertKind::HumHardLow => "hum_hard_low",
            AlertKind::HumHardHigh => "hum_hard_high",
            AlertKind::WaterTempLow => "water_temp_low",
            AlertKind::WaterTempHigh => "water_temp_high",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertState {
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_triggered: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_notified: Option<OffsetDateTime>,
    pub message: Option<String>,
    /// Monotonic twin of `last_notified` used for the cooldown.
    #[serde(skip)]
    pub(crate) notified_at: Option<Instant>,
}

/// One evaluation request for a single alert kind.
#[derive(Debug, Clone)]
pub struct AlertCheck {
    pub kind: AlertKind,
    pub breach: bool,
    pub recovered: bool,
    pub message: String,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Applies alert checks to the status record and fans out notifications
/// and audit records.
#[derive(Clone)]
pub struct AlertRegistry {
    events: EventLog,
    notifier: Notifier,
}

impl AlertRegistry {
    pub fn new(events: EventLog, notifier: Notifier) -> Self {
        Self { events, notifier }
    }

    /// Returns `true` when the caller must halt every output this tick.
    pub fn evaluate(
        &self,
        status: &mut RuntimeStatus,
        check: AlertCheck,
        cooldown: Duration,
        now: Instant,
    ) -> bool {
        let profile_id = status.profile_id.clone();
        let kind = check.kind;
        let state = status.alerts.entry(kind).or_default();

        if check.breach {
            if !state.active {
                state.active = true;
                state.first_triggered = Some(OffsetDateTime::now_utc());
                state.last_notified = state.first_triggered;
                state.notified_at = Some(now);
                state.message = Some(check.message.clone());

                error!(alert = %kind, "{}", check.message);
                self.notifier
                    .notify(format!("⛔ {}. All outputs halted.", check.message));
                self.events.log(
                    AuditEvent::new("alert", check.message.clone())
                        .reason(format!("{kind}:breach"))
                        .actor("safety")
                        .profile(profile_id.as_deref())
                        .payload(check.payload),
                );
                status.record_alert(check.message.clone());
                status.last_error = Some(check.message);
                return true;
            }

            let due = state
                .notified_at
                .map_or(true, |t| now.saturating_duration_since(t) >= cooldown);
            if due {
                state.notified_at = Some(now);
                state.last_notified = Some(OffsetDateTime::now_utc());
                warn!(alert = %kind, "still breached: {}", check.message);
                self.notifier
                    .notify(format!("⚠️ Still breached: {}", check.message));
            }
            state.message = Some(check.message);
            return true;
        }

        if check.recovered && state.active {
            state.active = false;
            state.first_triggered = None;
            state.message = None;

            info!(alert = %kind, "recovered");
            status.record_alert(format!("{kind} recovered"));
            self.events.log(
                AuditEvent::new("alert", format!("{kind} recovered"))
                    .reason(format!("{kind}:recover"))
                    .actor("safety")
                    .profile(profile_id.as_deref())
                    .payload(check.payload),
            );
            if !status.any_alert_active() {
                status.last_error = None;
            }
            self.notifier.notify(format!(
                "✅ Recovery: {kind} back within hard limit + hysteresis"
            ));
        }
        false
    }
}

// ===========================================================================
// Tests
// ===========================================================================
