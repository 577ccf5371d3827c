//! Pump/premix scheduler: decides when the main pump, agitator and air pump
//! run, gated by the profile's hour-of-day window.
//!
//! The scheduler is a pure decision engine driven by the control loop. It
//! never touches hardware; the loop reads [`Scheduler::outputs`] after each
//! [`Scheduler::step`] and drives the relays itself.
//!
//! ## State machine
//!
//! ```text
//!              ┌──────────────[window closes]───────────────┐
//!              ▼                                            │
//! WindowClosed ──[window opens]──▶ AwaitingNextOn ──[due − run]──▶ Premix{Air,Agitator,Both}
//!                                     ▲                                     │
//!                                     │                                  [due]
//!                                     └──────[on elapsed: due = now + off]── PumpOn
//!
//! Disabled      sink while on == off == 0
//! Paused        entered by pause(), left by resume()
//! HardStopped   entered by hard_stop(), left on the next clean step
//! ```
//!
//! Premix runs start so they finish exactly when the pump is due, and are
//! clamped to the due time when the off phase is shorter than the run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::{OffsetDateTime, Time};
use tokio::time::Instant;

use crate::profile::Profile;
use crate::recovery::{ResumePhase, ResumeSnapshot};
use crate::settings::{seconds, GlobalSettings};

// ---------------------------------------------------------------------------
// Hour window
// ---------------------------------------------------------------------------

/// Allowed irrigation hours `[start, end)`. Wraps midnight when
/// `start > end`; `start == end` never opens; unset means always open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: Option<u8>,
    pub end_hour: Option<u8>,
}

impl HourWindow {
    pub fn new(start_hour: u8, end_hour: u8) -> Self {
        Self {
            start_hour: Some(start_hour),
            end_hour: Some(end_hour),
        }
    }

    pub fn allows(&self, hour: u8) -> bool {
        match (self.start_hour, self.end_hour) {
            (Some(start), Some(end)) => {
                if start == end {
                    false
                } else if start < end {
                    (start..end).contains(&hour)
                } else {
                    hour >= start || hour < end
                }
            }
            _ => true,
        }
    }

    /// The next time the window opens after `now`, in `now`'s offset.
    /// `None` for an always-open or never-open window.
    pub fn next_open(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let (start, end) = (self.start_hour?, self.end_hour?);
        if start == end {
            return None;
        }
        let today = now.replace_time(Time::from_hms(start, 0, 0).ok()?);
        if today > now {
            Some(today)
        } else {
            Some(today + time::Duration::days(1))
        }
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Durations the scheduler works with, resolved from profile and settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTiming {
    pub on: Duration,
    pub off: Duration,
    pub air: Option<Duration>,
    pub agitator: Option<Duration>,
}

impl CycleTiming {
    pub fn from_profile(profile: &Profile, settings: &GlobalSettings) -> Self {
        let premix = profile.premix(&settings.premix);
        let run = |enabled: bool, s: f64| Some(seconds(s)).filter(|d| enabled && !d.is_zero());
        Self {
            on: seconds(profile.pump.on_s),
            off: seconds(profile.pump.off_s),
            air: run(premix.air_pump_enabled, premix.air_pump_run_s),
            agitator: run(premix.agitator_enabled, premix.agitator_run_s),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.on.is_zero() && self.off.is_zero()
    }

    pub fn longest_premix(&self) -> Duration {
        self.air
            .unwrap_or_default()
            .max(self.agitator.unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    WindowClosed {
        due: Option<Instant>,
        reopens_at: Option<OffsetDateTime>,
    },
    AwaitingNextOn {
        due: Instant,
    },
    PremixAirOnly {
        due: Instant,
        air_until: Instant,
    },
    PremixAgitatorOnly {
        due: Instant,
        agitator_until: Instant,
    },
    PremixBoth {
        due: Instant,
        air_until: Instant,
        agitator_until: Instant,
    },
    PumpOn {
        until: Instant,
    },
    Paused,
    HardStopped {
        due: Option<Instant>,
    },
}

impl SchedulerState {
    fn waiting(due: Instant, air: Option<Instant>, agitator: Option<Instant>) -> Self {
        match (air, agitator) {
            (None, None) => SchedulerState::AwaitingNextOn { due },
            (Some(air_until), None) => SchedulerState::PremixAirOnly { due, air_until },
            (None, Some(agitator_until)) => SchedulerState::PremixAgitatorOnly {
                due,
                agitator_until,
            },
            (Some(air_until), Some(agitator_until)) => SchedulerState::PremixBoth {
                due,
                air_until,
                agitator_until,
            },
        }
    }

    /// Next pump start still pending, if any.
    fn pending_due(&self) -> Option<Instant> {
        match *self {
            SchedulerState::AwaitingNextOn { due }
            | SchedulerState::PremixAirOnly { due, .. }
            | SchedulerState::PremixAgitatorOnly { due, .. }
            | SchedulerState::PremixBoth { due, .. } => Some(due),
            SchedulerState::WindowClosed { due, .. } | SchedulerState::HardStopped { due } => due,
            _ => None,
        }
    }

    /// `(air, agitator)` run ends for the premix variants.
    fn premix_ends(&self) -> (Option<Instant>, Option<Instant>) {
        match *self {
            SchedulerState::PremixAirOnly { air_until, .. } => (Some(air_until), None),
            SchedulerState::PremixAgitatorOnly { agitator_until, .. } => {
                (None, Some(agitator_until))
            }
            SchedulerState::PremixBoth {
                air_until,
                agitator_until,
                ..
            } => (Some(air_until), Some(agitator_until)),
            _ => (None, None),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SchedulerState::Disabled => "disabled",
            SchedulerState::WindowClosed { .. } => "window_closed",
            SchedulerState::AwaitingNextOn { .. } => "awaiting_next_on",
            SchedulerState::PremixAirOnly { .. } => "premix_air",
            SchedulerState::PremixAgitatorOnly { .. } => "premix_agitator",
            SchedulerState::PremixBoth { .. } => "premix_both",
            SchedulerState::PumpOn { .. } => "pump_on",
            SchedulerState::Paused => "paused",
            SchedulerState::HardStopped { .. } => "hard_stopped",
        }
    }
}

/// Desired irrigation outputs for the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outputs {
    pub pump: bool,
    pub agitator: bool,
    pub air_pump: bool,
}

/// Monotonic end of the running phase per output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseEnds {
    pub pump: Option<Instant>,
    pub agitator: Option<Instant>,
    pub air_pump: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Scheduler {
    state: SchedulerState,
    timing: CycleTiming,
    /// Premix runs already started for the pending cycle.
    air_started: bool,
    agitator_started: bool,
}

impl Scheduler {
    /// A fresh scheduler wants the pump immediately.
    pub fn new(timing: CycleTiming, now: Instant) -> Self {
        Self {
            state: SchedulerState::AwaitingNextOn { due: now },
            timing,
            air_started: false,
            agitator_started: false,
        }
    }

    pub fn configure(&mut self, timing: CycleTiming) {
        self.timing = timing;
    }

    pub fn timing(&self) -> &CycleTiming {
        &self.timing
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn label(&self) -> &'static str {
        self.state.label()
    }

    pub fn outputs(&self) -> Outputs {
        let (air, agitator) = self.state.premix_ends();
        Outputs {
            pump: matches!(self.state, SchedulerState::PumpOn { .. }),
            agitator: agitator.is_some(),
            air_pump: air.is_some(),
        }
    }

    pub fn phase_ends(&self) -> PhaseEnds {
        let (air_pump, agitator) = self.state.premix_ends();
        let pump = match self.state {
            SchedulerState::PumpOn { until } => Some(until),
            _ => None,
        };
        PhaseEnds {
            pump,
            agitator,
            air_pump,
        }
    }

    /// Earliest instant at which [`step`](Self::step) would change something.
    pub fn next_deadline(&self) -> Option<Instant> {
        let ends = self.phase_ends();
        let due = match self.state {
            SchedulerState::WindowClosed { .. } | SchedulerState::HardStopped { .. } => None,
            s => s.pending_due(),
        };
        let premix_starts = due.into_iter().flat_map(|due| {
            let air = self
                .timing
                .air
                .filter(|_| !self.air_started)
                .and_then(|run| due.checked_sub(run));
            let agitator = self
                .timing
                .agitator
                .filter(|_| !self.agitator_started)
                .and_then(|run| due.checked_sub(run));
            [air, agitator]
        });
        [ends.pump, ends.agitator, ends.air_pump, due]
            .into_iter()
            .chain(premix_starts)
            .flatten()
            .min()
    }

    fn reset_premix(&mut self) {
        self.air_started = false;
        self.agitator_started = false;
    }

    /// Advance the machine to `now`. Returns `true` when a pump phase started.
    pub fn step(
        &mut self,
        now: Instant,
        window_open: bool,
        reopens_at: Option<OffsetDateTime>,
    ) -> bool {
        if self.timing.is_disabled() {
            if self.state != SchedulerState::Disabled {
                self.state = SchedulerState::Disabled;
                self.reset_premix();
            }
            return false;
        }

        match self.state {
            SchedulerState::Paused => return false,
            SchedulerState::Disabled => self.state = SchedulerState::AwaitingNextOn { due: now },
            SchedulerState::HardStopped { due } => {
                self.state = SchedulerState::AwaitingNextOn {
                    due: due.unwrap_or(now),
                }
            }
            _ => {}
        }

        if !window_open {
            let due = match self.state {
                SchedulerState::PumpOn { .. } => None,
                s => s.pending_due(),
            };
            self.state = SchedulerState::WindowClosed { due, reopens_at };
            self.reset_premix();
            return false;
        }

        if let SchedulerState::WindowClosed { due, .. } = self.state {
            self.state = SchedulerState::AwaitingNextOn {
                due: due.unwrap_or(now),
            };
        }

        if let SchedulerState::PumpOn { until } = self.state {
            if now < until {
                return false;
            }
            self.state = SchedulerState::AwaitingNextOn {
                due: now + self.timing.off,
            };
            self.reset_premix();
        }

        let Some(due) = self.state.pending_due() else {
            return false;
        };
        let (mut air, mut agitator) = self.state.premix_ends();
        air = air.filter(|end| now < *end);
        agitator = agitator.filter(|end| now < *end);

        if now >= due {
            self.reset_premix();
            if self.timing.on.is_zero() {
                self.state = SchedulerState::AwaitingNextOn {
                    due: now + self.timing.off,
                };
                return false;
            }
            self.state = SchedulerState::PumpOn {
                until: now + self.timing.on,
            };
            return true;
        }

        if let Some(run) = self.timing.air {
            if !self.air_started && now + run >= due {
                air = Some((now + run).min(due));
                self.air_started = true;
            }
        }
        if let Some(run) = self.timing.agitator {
            if !self.agitator_started && now + run >= due {
                agitator = Some((now + run).min(due));
                self.agitator_started = true;
            }
        }

        self.state = SchedulerState::waiting(due, air, agitator);
        false
    }

    /// Out-of-band premix: start agitator and air pump now and push the next
    /// pump start out far enough for them to finish.
    pub fn kick(&mut self, now: Instant) {
        if matches!(self.state, SchedulerState::Disabled | SchedulerState::Paused) {
            return;
        }
        let existing = self
            .state
            .pending_due()
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or_default();
        let delay = existing.max(self.timing.longest_premix());
        let air = self.timing.air.map(|run| now + run.min(delay));
        let agitator = self.timing.agitator.map(|run| now + run.min(delay));

        self.air_started = air.is_some();
        self.agitator_started = agitator.is_some();
        self.state = SchedulerState::waiting(now + delay, air, agitator);
    }

    /// Freeze the machine and capture what was left of each phase.
    pub fn pause(&mut self, now: Instant) -> ResumeSnapshot {
        let remaining = |end: Instant| ResumePhase {
            on: true,
            remaining_s: end.saturating_duration_since(now).as_secs_f64(),
        };
        let snapshot = match self.state {
            SchedulerState::PumpOn { until } => ResumeSnapshot {
                pump: remaining(until),
                ..ResumeSnapshot::default()
            },
            SchedulerState::Paused => return ResumeSnapshot::default(),
            SchedulerState::WindowClosed { due, .. } => ResumeSnapshot {
                due_in_s: due.map(|due| due.saturating_duration_since(now).as_secs_f64()),
                window_closed: true,
                ..ResumeSnapshot::default()
            },
            s => {
                let (air, agitator) = s.premix_ends();
                ResumeSnapshot {
                    pump: ResumePhase::default(),
                    agitator: agitator.map(remaining).unwrap_or_default(),
                    air_pump: air.map(remaining).unwrap_or_default(),
                    due_in_s: s
                        .pending_due()
                        .map(|due| due.saturating_duration_since(now).as_secs_f64()),
                    window_closed: false,
                }
            }
        };
        self.state = SchedulerState::Paused;
        snapshot
    }

    /// Rebuild the running phases from a pause snapshot.
    pub fn resume(&mut self, snapshot: &ResumeSnapshot, now: Instant) {
        let left = |phase: &ResumePhase, full: Option<Duration>| -> Option<Duration> {
            if !phase.on {
                return None;
            }
            let d = seconds(phase.remaining_s);
            Some(if d.is_zero() { full.unwrap_or_default() } else { d }).filter(|d| !d.is_zero())
        };

        if snapshot.window_closed {
            self.state = SchedulerState::WindowClosed {
                due: snapshot.due_in_s.map(|due_in| now + seconds(due_in)),
                reopens_at: None,
            };
            self.reset_premix();
            return;
        }

        if snapshot.pump.on {
            let run = left(&snapshot.pump, Some(self.timing.on)).unwrap_or(self.timing.on);
            self.state = SchedulerState::PumpOn { until: now + run };
            self.reset_premix();
            return;
        }

        let air = left(&snapshot.air_pump, self.timing.air);
        let agitator = left(&snapshot.agitator, self.timing.agitator);
        let longest = air.unwrap_or_default().max(agitator.unwrap_or_default());
        let due = match snapshot.due_in_s {
            Some(due_in) => now + seconds(due_in).max(longest),
            None if !longest.is_zero() => now + longest,
            None => now + self.timing.off,
        };

        self.air_started |= air.is_some();
        self.agitator_started |= agitator.is_some();
        self.state = SchedulerState::waiting(due, air.map(|d| now + d), agitator.map(|d| now + d));
    }

    /// Force everything off after a safety breach, keeping the pending start.
    pub fn hard_stop(&mut self, now: Instant) {
        let due = match self.state {
            SchedulerState::PumpOn { .. } => Some(now),
            s => s.pending_due(),
        };
        self.state = SchedulerState::HardStopped { due };
        self.reset_premix();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn timing(on: u64, off: u64) -> CycleTiming {
        CycleTiming {
            on: secs(on),
            off: secs(off),
            air: None,
            agitator: None,
        }
    }

    /// Step once per 100 ms from `from` to `to` and collect pump state.
    fn pump_trace(s: &mut Scheduler, t0: Instant, from_ms: u64, to_ms: u64) -> Vec<(u64, bool)> {
        (from_ms..to_ms)
            .step_by(100)
            .map(|ms| {
                s.step(t0 + Duration::from_millis(ms), true, None);
                (ms, s.outputs().pump)
            })
            .collect()
    }

    // -- Window gating -----------------------------------------------------

    #[test]
    fn window_wraps_midnight() {
        let w = HourWindow::new(22, 6);
        assert!(w.allows(23));
        assert!(w.allows(2));
        assert!(!w.allows(12));
        assert!(!w.allows(6));
        assert!(w.allows(22));
    }

    #[test]
    fn window_plain_and_degenerate() {
        let w = HourWindow::new(6, 20);
        assert!(w.allows(6));
        assert!(!w.allows(20));
        assert!(!HourWindow::new(8, 8).allows(8));
        assert!(HourWindow::default().allows(3));
    }

    #[test]
    fn next_open_rolls_to_tomorrow_after_start() {
        let w = HourWindow::new(6, 22);
        assert_eq!(
            w.next_open(datetime!(2026-03-01 23:30 UTC)),
            Some(datetime!(2026-03-02 06:00 UTC))
        );
        assert_eq!(
            w.next_open(datetime!(2026-03-01 04:15 UTC)),
            Some(datetime!(2026-03-01 06:00 UTC))
        );
        assert_eq!(HourWindow::default().next_open(datetime!(2026-03-01 04:15 UTC)), None);
        assert_eq!(HourWindow::new(5, 5).next_open(datetime!(2026-03-01 04:15 UTC)), None);
    }

    // -- Pump cycle --------------------------------------------------------

    #[test]
    fn pump_cycles_on_ten_off_twenty() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);

        for (ms, on) in pump_trace(&mut s, t0, 0, 45_000) {
            let expected = ms < 10_000 || (30_000..40_000).contains(&ms);
            assert_eq!(on, expected, "t={ms}ms");
        }
    }

    #[test]
    fn step_reports_pump_start_once() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        assert!(s.step(t0, true, None));
        assert!(!s.step(t0 + secs(1), true, None));
        assert_eq!(s.next_deadline(), Some(t0 + secs(10)));
    }

    #[test]
    fn disabled_schedule_is_a_sink() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(0, 0), t0);
        for i in 0..5 {
            assert!(!s.step(t0 + secs(i), true, None));
            assert_eq!(s.state(), SchedulerState::Disabled);
            assert_eq!(s.outputs(), Outputs::default());
        }
        s.configure(timing(5, 5));
        assert!(s.step(t0 + secs(10), true, None));
    }

    // -- Premix ------------------------------------------------------------

    #[test]
    fn premix_finishes_exactly_when_pump_due() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(
            CycleTiming {
                air: Some(secs(5)),
                agitator: Some(secs(15)),
                ..timing(10, 20)
            },
            t0,
        );
        s.step(t0, true, None);
        s.step(t0 + secs(10), true, None);
        // Pump off at 10, due at 30: agitator from 15, air from 25.
        assert_eq!(s.next_deadline(), Some(t0 + secs(15)));

        s.step(t0 + secs(15), true, None);
        assert!(matches!(s.state(), SchedulerState::PremixAgitatorOnly { agitator_until, .. } if agitator_until == t0 + secs(30)));

        s.step(t0 + secs(25), true, None);
        assert_eq!(
            s.outputs(),
            Outputs {
                pump: false,
                agitator: true,
                air_pump: true
            }
        );

        assert!(s.step(t0 + secs(30), true, None));
        assert_eq!(
            s.outputs(),
            Outputs {
                pump: true,
                agitator: false,
                air_pump: false
            }
        );
    }

    #[test]
    fn premix_clamped_when_off_phase_is_short() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(
            CycleTiming {
                agitator: Some(secs(15)),
                ..timing(10, 5)
            },
            t0,
        );
        s.step(t0, true, None);
        s.step(t0 + secs(10), true, None);
        assert_eq!(
            s.state(),
            SchedulerState::PremixAgitatorOnly {
                due: t0 + secs(15),
                agitator_until: t0 + secs(15)
            }
        );
        assert!(s.step(t0 + secs(15), true, None), "pump start never delayed");
    }

    #[test]
    fn kick_starts_premix_now_and_delays_pump() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(
            CycleTiming {
                air: Some(secs(5)),
                agitator: Some(secs(8)),
                ..timing(10, 20)
            },
            t0,
        );
        s.kick(t0);
        assert_eq!(
            s.state(),
            SchedulerState::PremixBoth {
                due: t0 + secs(8),
                air_until: t0 + secs(5),
                agitator_until: t0 + secs(8)
            }
        );

        s.step(t0 + secs(5), true, None);
        assert!(!s.outputs().air_pump);
        assert!(s.outputs().agitator);
        s.step(t0 + secs(6), true, None);
        assert!(!s.outputs().air_pump, "air run is not restarted for the same cycle");
        assert!(s.step(t0 + secs(8), true, None));
    }

    #[test]
    fn kick_without_premix_starts_pump_at_pending_due() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        s.step(t0 + secs(10), true, None);
        s.kick(t0 + secs(12));
        assert_eq!(s.state(), SchedulerState::AwaitingNextOn { due: t0 + secs(30) });
    }

    // -- Window transitions ------------------------------------------------

    #[test]
    fn leaving_window_forces_everything_off() {
        let t0 = Instant::now();
        let reopen = datetime!(2026-03-02 06:00 UTC);
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        assert!(s.outputs().pump);

        s.step(t0 + secs(2), false, Some(reopen));
        assert_eq!(s.outputs(), Outputs::default());
        assert_eq!(
            s.state(),
            SchedulerState::WindowClosed {
                due: None,
                reopens_at: Some(reopen)
            }
        );

        // Re-entry with nothing pending starts immediately.
        assert!(s.step(t0 + secs(100), true, None));
    }

    #[test]
    fn window_reentry_keeps_pending_due() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        s.step(t0 + secs(10), true, None);
        s.step(t0 + secs(11), false, None);
        assert!(!s.step(t0 + secs(12), true, None));
        assert_eq!(s.state(), SchedulerState::AwaitingNextOn { due: t0 + secs(30) });
    }

    // -- Pause / resume ----------------------------------------------------

    #[test]
    fn resume_continues_pump_with_remaining_time() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);

        let snap = s.pause(t0 + secs(6));
        assert!(snap.pump.on);
        assert!((snap.pump.remaining_s - 4.0).abs() < 1e-6);
        assert_eq!(s.outputs(), Outputs::default());
        assert!(!s.step(t0 + secs(50), true, None), "paused ignores steps");

        let resumed_at = t0 + secs(106);
        s.resume(&snap, resumed_at);
        assert_eq!(s.state(), SchedulerState::PumpOn { until: resumed_at + secs(4) });
        s.step(resumed_at + Duration::from_millis(3_900), true, None);
        assert!(s.outputs().pump);
        s.step(resumed_at + secs(4), true, None);
        assert!(!s.outputs().pump);
    }

    #[test]
    fn resume_keeps_off_phase_countdown() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        s.step(t0 + secs(10), true, None);

        let snap = s.pause(t0 + secs(15));
        assert_eq!(snap.due_in_s, Some(15.0));

        let resumed_at = t0 + secs(200);
        s.resume(&snap, resumed_at);
        assert_eq!(s.state(), SchedulerState::AwaitingNextOn { due: resumed_at + secs(15) });
    }

    #[test]
    fn pause_outside_window_starts_pump_when_it_reopens() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        s.step(t0 + secs(2), false, None);

        let snap = s.pause(t0 + secs(5));
        assert!(snap.window_closed);
        assert_eq!(snap.due_in_s, None);

        let resumed_at = t0 + secs(60);
        s.resume(&snap, resumed_at);
        assert!(!s.step(resumed_at, false, None), "window still closed");
        assert!(s.step(resumed_at + secs(1), true, None), "pump starts on reopen");
        assert_eq!(s.state(), SchedulerState::PumpOn { until: resumed_at + secs(11) });
    }

    #[test]
    fn resume_restarts_interrupted_premix() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(
            CycleTiming {
                agitator: Some(secs(10)),
                ..timing(10, 20)
            },
            t0,
        );
        s.kick(t0);
        let snap = s.pause(t0 + secs(4));
        assert!(snap.agitator.on);

        let resumed_at = t0 + secs(60);
        s.resume(&snap, resumed_at);
        assert_eq!(
            s.state(),
            SchedulerState::PremixAgitatorOnly {
                due: resumed_at + secs(6),
                agitator_until: resumed_at + secs(6)
            }
        );
    }

    // -- Hard stop ---------------------------------------------------------

    #[test]
    fn hard_stop_turns_off_and_restarts_after_clear() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(timing(10, 20), t0);
        s.step(t0, true, None);
        s.hard_stop(t0 + secs(3));
        assert_eq!(s.outputs(), Outputs::default());
        assert_eq!(s.label(), "hard_stopped");

        assert!(s.step(t0 + secs(40), true, None));
    }
}
