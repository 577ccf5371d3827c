//! The control loop: one task per active run.
//!
//! Every tick runs the same fixed sequence under a single status write
//! guard, so readers only ever see whole ticks:
//!
//! ```text
//! sensors → reservoir → hard alerts ─(halt)→ all off, sleep 1 s
//!                                   └→ climate → window gate → scheduler → timers
//! ```
//!
//! followed by an optional checkpoint and a deadline-aware sleep that a stop
//! signal interrupts.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertCheck, AlertKind, AlertRegistry};
use crate::climate::{regulate, ClimateMemory, ClimateTargets, ClimateTuning};
use crate::events::EventLog;
use crate::hardware::{read_climate, Actuators, AirTemperatures, ClimateSample, Device, Humidity, Sensors};
use crate::notify::Notifier;
use crate::profile::{Profile, ProfileStore, ProfileWatcher};
use crate::recovery::{Checkpoint, CheckpointStore};
use crate::reservoir::{ReservoirReport, ReservoirTracker};
use crate::scheduler::{CycleTiming, PhaseEnds, Scheduler};
use crate::settings::{GlobalSettings, SettingsStore};
use crate::state::{ClimateReadings, PhaseTimer, RuntimeStatus, SharedState, Thresholds};

const PAUSED_SLEEP: Duration = Duration::from_millis(250);
const WINDOW_SLEEP: Duration = Duration::from_millis(250);
const IDLE_SLEEP: Duration = Duration::from_millis(250);
const HARD_STOP_SLEEP: Duration = Duration::from_secs(1);
const MIN_DEADLINE_SLEEP: Duration = Duration::from_millis(20);
const MAX_DEADLINE_SLEEP: Duration = Duration::from_millis(50);

const SETTINGS_REFRESH: Duration = Duration::from_secs(5);
const PROFILE_POLL: Duration = Duration::from_secs(3);
const CHECKPOINT_EVERY: Duration = Duration::from_secs(60);

/// A probe that stays silent longer than this no longer counts as valid.
const READING_HOLD: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Last-good readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Held {
    value: f64,
    at: Instant,
}

fn hold(slot: &mut Option<Held>, fresh: Option<f64>, now: Instant) -> Option<f64> {
    if let Some(value) = fresh.filter(|v| v.is_finite()) {
        *slot = Some(Held { value, at: now });
    }
    slot.filter(|h| now.saturating_duration_since(h.at) <= READING_HOLD)
        .map(|h| h.value)
}

/// Per-probe last-good values, so one flaky sensor read does not drop the
/// whole reading.
#[derive(Debug, Default)]
struct HeldReadings {
    temp_top: Option<Held>,
    temp_bottom: Option<Held>,
    hum_top: Option<Held>,
    hum_bottom: Option<Held>,
    water: Option<Held>,
}

impl HeldReadings {
    fn apply(&mut self, sample: &ClimateSample, now: Instant) -> ClimateReadings {
        let air = AirTemperatures::from_probes(
            hold(&mut self.temp_top, sample.air.top, now),
            hold(&mut self.temp_bottom, sample.air.bottom, now),
        );
        let humidity = Humidity::from_probes(
            hold(&mut self.hum_top, sample.humidity.top, now),
            hold(&mut self.hum_bottom, sample.humidity.bottom, now),
        );
        ClimateReadings {
            temperature_c: air.avg,
            humidity_pct: humidity.avg,
            water_temp_c: hold(&mut self.water, sample.water_temp_c, now),
            air,
            humidity,
            updated_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Actuation
// ---------------------------------------------------------------------------

/// Command one output and mirror what the hardware actually ended up in.
/// A manual override on the device wins over `on`.
pub(crate) fn drive(st: &mut RuntimeStatus, hw: &dyn Actuators, device: Device, on: bool) -> bool {
    let on = st.overrides.get(&device).map_or(on, |o| o.on);
    if let Err(e) = hw.set(device, on) {
        warn!(%device, on, "actuator command failed: {e:#}");
        st.record_error(format!("{device} command failed: {e}"));
    }
    let actual = hw.is_on(device);
    st.actuators.set(device, actual);
    actual
}

/// Release every manual override and drive the run outputs off.
pub(crate) fn all_run_outputs_off(st: &mut RuntimeStatus, hw: &dyn Actuators) {
    if !st.overrides.is_empty() {
        info!(held = st.overrides.len(), "manual overrides released");
        st.overrides.clear();
    }
    idle_run_outputs(st, hw);
}

/// Drive the run outputs off, leaving manually held ones alone.
fn idle_run_outputs(st: &mut RuntimeStatus, hw: &dyn Actuators) {
    for device in Device::RUN_OUTPUTS {
        drive(st, hw, device, false);
    }
    st.fan_cause = None;
    st.timers.clear();
}

fn sync_timer(timer: &mut PhaseTimer, running: bool, end: Option<Instant>, now: Instant) {
    match end.filter(|_| running) {
        Some(end) => timer.arm(end, now),
        None => timer.clear(),
    }
    timer.refresh(now);
}

// ---------------------------------------------------------------------------
// Hard-limit checks
// ---------------------------------------------------------------------------

/// Breach against the raw limit, recovery past limit plus margin. A missing
/// value reports neither.
fn low_check(value: Option<f64>, min: f64, margin: f64) -> (bool, bool) {
    match value {
        Some(v) => (v < min, v >= min + margin),
        None => (false, false),
    }
}

fn high_check(value: Option<f64>, max: f64, margin: f64) -> (bool, bool) {
    match value {
        Some(v) => (v > max, v <= max - margin),
        None => (false, false),
    }
}

fn alert_checks(
    report: &ReservoirReport,
    readings: &ClimateReadings,
    settings: &GlobalSettings,
) -> Vec<AlertCheck> {
    let lim = &settings.limits;
    let res = &settings.reservoir;
    let mut checks = Vec::with_capacity(7);

    let water = report.below_cutoff_value;
    let (breach, recovered) = match (report.below_cutoff, water) {
        (Some(below), Some(v)) => (below, v > res.cutoff_kg + res.hysteresis_kg),
        _ => (false, false),
    };
    checks.push(AlertCheck {
        kind: AlertKind::ReservoirCutoff,
        breach,
        recovered,
        message: format!(
            "Reservoir {:.2} kg ≤ cutoff {:.2} kg",
            water.unwrap_or(0.0),
            res.cutoff_kg
        ),
        payload: json!({
            "gross_kg": report.gross_kg,
            "water_kg": water,
            "cutoff_kg": res.cutoff_kg,
        }),
    });

    let t = readings.temperature_c;
    let t_hyst = settings.temp_recovery_margin();
    let tv = t.unwrap_or(f64::NAN);
    let (breach, recovered) = low_check(t, lim.temp_min_c, t_hyst);
    checks.push(AlertCheck {
        kind: AlertKind::TempHardLow,
        breach,
        recovered,
        message: format!("Temperature {tv:.1}°C below hard minimum {}°C", lim.temp_min_c),
        payload: json!({ "air_t": t, "min_c": lim.temp_min_c, "hyst_c": t_hyst }),
    });
    let (breach, recovered) = high_check(t, lim.temp_max_c, t_hyst);
    checks.push(AlertCheck {
        kind: AlertKind::TempHardHigh,
        breach,
        recovered,
        message: format!("Temperature {tv:.1}°C above hard maximum {}°C", lim.temp_max_c),
        payload: json!({ "air_t": t, "max_c": lim.temp_max_c, "hyst_c": t_hyst }),
    });

    let h = readings.humidity_pct;
    let h_hyst = settings.humidity_recovery_margin();
    let hv = h.unwrap_or(f64::NAN);
    let (breach, recovered) = low_check(h, lim.humidity_min_pct, h_hyst);
    checks.push(AlertCheck {
        kind: AlertKind::HumHardLow,
        breach,
        recovered,
        message: format!("Humidity {hv:.1}% below hard minimum {}%", lim.humidity_min_pct),
        payload: json!({ "humidity": h, "min_pct": lim.humidity_min_pct, "hyst_pct": h_hyst }),
    });
    let (breach, recovered) = high_check(h, lim.humidity_max_pct, h_hyst);
    checks.push(AlertCheck {
        kind: AlertKind::HumHardHigh,
        breach,
        recovered,
        message: format!("Humidity {hv:.1}% above hard maximum {}%", lim.humidity_max_pct),
        payload: json!({ "humidity": h, "max_pct": lim.humidity_max_pct, "hyst_pct": h_hyst }),
    });

    let w = readings.water_temp_c;
    let w_hyst = settings.water_temp_recovery_margin();
    let wv = w.unwrap_or(f64::NAN);
    if let Some(min) = lim.water_temp_min_c {
        let (breach, recovered) = low_check(w, min, w_hyst);
        checks.push(AlertCheck {
            kind: AlertKind::WaterTempLow,
            breach,
            recovered,
            message: format!("Water temperature {wv:.1}°C below hard minimum {min}°C"),
            payload: json!({ "water_c": w, "min_c": min, "hyst_c": w_hyst }),
        });
    }
    if let Some(max) = lim.water_temp_max_c {
        let (breach, recovered) = high_check(w, max, w_hyst);
        checks.push(AlertCheck {
            kind: AlertKind::WaterTempHigh,
            breach,
            recovered,
            message: format!("Water temperature {wv:.1}°C above hard maximum {max}°C"),
            payload: json!({ "water_c": w, "max_c": max, "hyst_c": w_hyst }),
        });
    }
    checks
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Inputs gathered before the status lock is taken.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub now: Instant,
    /// Local wall clock, for the hour window.
    pub wall: OffsetDateTime,
    pub climate: ClimateSample,
    pub reservoir_gross_kg: Option<f64>,
}

/// Per-run controller state carried between ticks.
pub struct Engine {
    tracker: ReservoirTracker,
    alerts: AlertRegistry,
    climate: ClimateMemory,
    scheduler: Scheduler,
    held: HeldReadings,
    was_paused: bool,
}

impl Engine {
    pub fn new(profile: &Profile, settings: &GlobalSettings, alerts: AlertRegistry, now: Instant) -> Self {
        Self {
            tracker: ReservoirTracker::new(settings.reservoir.smoothing_tau_s),
            alerts,
            climate: ClimateMemory::default(),
            scheduler: Scheduler::new(CycleTiming::from_profile(profile, settings), now),
            held: HeldReadings::default(),
            was_paused: false,
        }
    }

    /// Run one tick and return how long to sleep before the next.
    pub fn tick(
        &mut self,
        st: &mut RuntimeStatus,
        input: &TickInput,
        hw: &dyn Actuators,
        settings: &GlobalSettings,
        profile: &Profile,
    ) -> Duration {
        let now = input.now;
        self.scheduler
            .configure(CycleTiming::from_profile(profile, settings));
        st.thresholds = Some(Thresholds::from_profile(profile));

        // ── Sensors ──────────────────────────────────────────────
        let mut readings = self.held.apply(&input.climate, now);
        readings.updated_at = Some(input.wall);
        st.readings = readings;

        // ── Pause edge ───────────────────────────────────────────
        if st.paused {
            if !self.was_paused {
                let snapshot = self.scheduler.pause(now);
                debug!(?snapshot, "pause snapshot captured");
                st.store_resume(snapshot);
                idle_run_outputs(st, hw);
                self.climate = ClimateMemory::default();
                self.was_paused = true;
                info!("run paused");
            }
            st.reservoir = Some(self.tracker.update(
                input.reservoir_gross_kg,
                &settings.reservoir,
                false,
                now,
            ));
            st.scheduler_phase = Some(self.scheduler.label());
            return PAUSED_SLEEP;
        }
        if self.was_paused {
            let snapshot = st.take_resume().unwrap_or_default();
            self.scheduler.resume(&snapshot, now);
            self.was_paused = false;
            info!(?snapshot, "run resumed");
        }

        // ── Reservoir ────────────────────────────────────────────
        let report = self.tracker.update(
            input.reservoir_gross_kg,
            &settings.reservoir,
            st.actuators.pump,
            now,
        );

        // ── Hard alerts ──────────────────────────────────────────
        let cooldown = settings.alert_cooldown();
        let mut halt = false;
        for check in alert_checks(&report, &readings, settings) {
            halt |= self.alerts.evaluate(st, check, cooldown, now);
        }
        st.reservoir = Some(report);
        if halt || st.any_alert_active() {
            all_run_outputs_off(st, hw);
            self.climate = ClimateMemory::default();
            self.scheduler.hard_stop(now);
            st.scheduler_phase = Some(self.scheduler.label());
            return HARD_STOP_SLEEP;
        }
        if st.last_error.is_some() {
            debug!("clearing stale error, no alert active");
            st.last_error = None;
        }

        // ── Climate ──────────────────────────────────────────────
        let decision = regulate(
            readings.temperature_c,
            readings.humidity_pct,
            &ClimateTargets::from_profile(profile),
            &ClimateTuning::from_settings(settings),
            &self.climate,
            now,
        );
        let fan = drive(st, hw, Device::Fan, decision.fan);
        let heater = drive(st, hw, Device::Heater, decision.heater);
        let humidifier = drive(st, hw, Device::Humidifier, decision.humidifier);
        self.climate
            .commit(fan, heater, humidifier, decision.fan_cause, now);
        st.fan_cause = self.climate.fan_cause;

        // ── Window gate & scheduler ──────────────────────────────
        let window_open = profile.window.allows(input.wall.hour());
        st.next_window_open = if window_open {
            None
        } else {
            profile.window.next_open(input.wall)
        };
        if window_open && st.take_kick() {
            self.scheduler.kick(now);
            info!(phase = self.scheduler.label(), "premix kick");
        }
        if self.scheduler.step(now, window_open, st.next_window_open) {
            st.cycle_count += 1;
            info!(cycle = st.cycle_count, "pump cycle started");
        }
        let out = self.scheduler.outputs();
        let pump = drive(st, hw, Device::MainPump, out.pump);
        let agitator = drive(st, hw, Device::Agitator, out.agitator);
        let air_pump = drive(st, hw, Device::AirPump, out.air_pump);

        // ── Countdowns ───────────────────────────────────────────
        let PhaseEnds {
            pump: pump_end,
            agitator: agitator_end,
            air_pump: air_end,
        } = self.scheduler.phase_ends();
        sync_timer(&mut st.timers.pump, pump, pump_end, now);
        sync_timer(&mut st.timers.agitator, agitator, agitator_end, now);
        sync_timer(&mut st.timers.air_pump, air_pump, air_end, now);
        st.scheduler_phase = Some(self.scheduler.label());

        // ── Sleep ────────────────────────────────────────────────
        if !window_open {
            return WINDOW_SLEEP;
        }
        match self.scheduler.next_deadline() {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(now);
                if left < IDLE_SLEEP {
                    left.clamp(MIN_DEADLINE_SLEEP, MAX_DEADLINE_SLEEP)
                } else {
                    IDLE_SLEEP
                }
            }
            None => IDLE_SLEEP,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    /// Operator stop: the checkpoint is discarded.
    Stop,
    /// Process exit: the checkpoint is kept for a later resume.
    Shutdown,
}

/// Everything a run needs from the rest of the process.
#[derive(Clone)]
pub struct LoopContext {
    pub status: SharedState,
    pub sensors: Arc<dyn Sensors>,
    pub actuators: Arc<dyn Actuators>,
    pub settings: Arc<SettingsStore>,
    pub profiles: ProfileStore,
    pub checkpoints: CheckpointStore,
    pub events: EventLog,
    pub notifier: Notifier,
    pub scale: watch::Receiver<Option<f64>>,
    pub utc_offset: UtcOffset,
}

impl LoopContext {
    pub fn local_now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.utc_offset)
    }
}

async fn save_checkpoint(store: &CheckpointStore, checkpoint: Checkpoint) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.save(&checkpoint)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("checkpoint not saved: {e:#}"),
        Err(e) => warn!("checkpoint task aborted: {e}"),
    }
}

/// Drive one run until signalled. All run outputs are off when this returns.
pub async fn run(ctx: LoopContext, profile: Profile, mut signal: watch::Receiver<RunSignal>) {
    let profile_id = profile.id.clone();
    let mut watcher = ProfileWatcher::new(&ctx.profiles, profile);
    let start = Instant::now();
    let mut engine = Engine::new(
        watcher.profile(),
        &ctx.settings.load(),
        AlertRegistry::new(ctx.events.clone(), ctx.notifier.clone()),
        start,
    );
    let mut settings_checked = start;
    let mut profile_checked = start;
    let mut checkpointed: Option<Instant> = None;

    info!(profile = %profile_id, "control loop started");

    let exit = loop {
        let signalled = *signal.borrow();
        if signalled != RunSignal::Run {
            break signalled;
        }

        let now = Instant::now();
        if now.duration_since(settings_checked) >= SETTINGS_REFRESH {
            settings_checked = now;
            ctx.settings.refresh();
        }
        if now.duration_since(profile_checked) >= PROFILE_POLL {
            profile_checked = now;
            watcher.poll();
        }
        let settings = ctx.settings.load();

        let climate = read_climate(ctx.sensors.clone()).await;
        let input = TickInput {
            now: Instant::now(),
            wall: ctx.local_now(),
            climate,
            reservoir_gross_kg: *ctx.scale.borrow(),
        };

        let (sleep, checkpoint) = {
            let mut st = ctx.status.write().await;
            let sleep = engine.tick(&mut st, &input, ctx.actuators.as_ref(), &settings, watcher.profile());
            let due = checkpointed.map_or(true, |t| input.now.duration_since(t) >= CHECKPOINT_EVERY);
            let checkpoint = if due {
                checkpointed = Some(input.now);
                Checkpoint::from_status(&st)
            } else {
                None
            };
            (sleep, checkpoint)
        };
        if let Some(cp) = checkpoint {
            save_checkpoint(&ctx.checkpoints, cp).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            changed = signal.changed() => {
                if changed.is_err() {
                    break RunSignal::Shutdown;
                }
            }
        }
    };

    let final_checkpoint = {
        let mut st = ctx.status.write().await;
        // Captured before the outputs drop so a resume can tell the run was
        // mid-cycle.
        let cp = match exit {
            RunSignal::Shutdown => Checkpoint::from_status(&st),
            _ => None,
        };
        all_run_outputs_off(&mut st, ctx.actuators.as_ref());
        st.end_run();
        cp
    };
    match final_checkpoint {
        Some(cp) => save_checkpoint(&ctx.checkpoints, cp).await,
        None => {
            if let Err(e) = ctx.checkpoints.clear() {
                warn!("checkpoint not cleared: {e:#}");
            }
        }
    }
    info!(profile = %profile_id, ?exit, "control loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
