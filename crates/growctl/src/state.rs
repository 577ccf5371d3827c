use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::alerts::{AlertKind, AlertState};
use crate::climate::FanCause;
use crate::dosing::{DosePlan, DosePump};
use crate::hardware::{AirTemperatures, Device, Humidity};
use crate::profile::{Band, Profile};
use crate::recovery::{Checkpoint, ResumeSnapshot};
use crate::reservoir::ReservoirReport;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<RuntimeStatus>>;

pub fn shared(status: RuntimeStatus) -> SharedState {
    Arc::new(RwLock::new(status))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// The single mutable record shared by the control loop, the workers, the
/// dosing sequencer and the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    #[serde(skip)]
    pub booted_at: StdInstant,
    pub profile_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub cycle_count: u64,
    pub paused: bool,
    pub last_error: Option<String>,
    pub actuators: ActuatorStates,
    pub fan_cause: Option<FanCause>,
    pub timers: PhaseTimers,
    pub scheduler_phase: Option<&'static str>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_window_open: Option<OffsetDateTime>,
    pub readings: ClimateReadings,
    pub thresholds: Option<Thresholds>,
    pub reservoir: Option<ReservoirReport>,
    pub alerts: BTreeMap<AlertKind, AlertState>,
    pub dosing: DosingStatus,
    /// Outputs held by hand. The loop's decisions are ignored for these
    /// until released.
    pub overrides: BTreeMap<Device, ManualOverride>,
    pub renewal: Option<Renewal>,
    /// Checkpoint found at startup that can be resumed.
    pub recoverable: Option<Checkpoint>,
    pub events: VecDeque<SystemEvent>,
    #[serde(skip)]
    kick_requested: bool,
    #[serde(skip)]
    resume: Option<ResumeSnapshot>,
}

/// Mirror of the last state actually commanded to each output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorStates {
    pub fan: bool,
    pub heater: bool,
    pub humidifier: bool,
    pub pump: bool,
    pub agitator: bool,
    pub air_pump: bool,
    pub nutrient_a: bool,
    pub nutrient_b: bool,
}

impl ActuatorStates {
    pub fn get(&self, device: Device) -> bool {
        match device {
            Device::Fan => self.fan,
            Device::Heater => self.heater,
            Device::Humidifier => self.humidifier,
            Device::MainPump => self.pump,
            Device::Agitator => self.agitator,
            Device::AirPump => self.air_pump,
            Device::NutrientA => self.nutrient_a,
            Device::NutrientB => self.nutrient_b,
        }
    }

    pub fn set(&mut self, device: Device, on: bool) {
        let slot = match device {
            Device::Fan => &mut self.fan,
            Device::Heater => &mut self.heater,
            Device::Humidifier => &mut self.humidifier,
            Device::MainPump => &mut self.pump,
            Device::Agitator => &mut self.agitator,
            Device::AirPump => &mut self.air_pump,
            Device::NutrientA => &mut self.nutrient_a,
            Device::NutrientB => &mut self.nutrient_b,
        };
        *slot = on;
    }
}

/// Countdown for one running phase. `end` is monotonic and cleared as soon
/// as the output turns off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimer {
    #[serde(skip)]
    pub end: Option<Instant>,
    pub total_s: Option<f64>,
    pub remaining_s: Option<f64>,
}

impl PhaseTimer {
    pub fn arm(&mut self, end: Instant, now: Instant) {
        if self.end != Some(end) {
            self.end = Some(end);
            self.total_s = Some(end.saturating_duration_since(now).as_secs_f64());
        }
    }

    pub fn clear(&mut self) {
        *self = PhaseTimer::default();
    }

    pub fn refresh(&mut self, now: Instant) {
        self.remaining_s = self
            .end
            .map(|end| round1(end.saturating_duration_since(now).as_secs_f64()));
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimers {
    pub pump: PhaseTimer,
    pub agitator: PhaseTimer,
    pub air_pump: PhaseTimer,
}

impl PhaseTimers {
    pub fn clear(&mut self) {
        *self = PhaseTimers::default();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClimateReadings {
    /// Mean air temperature used for regulation and limits.
    pub temperature_c: Option<f64>,
    /// Mean relative humidity used for regulation and limits.
    pub humidity_pct: Option<f64>,
    pub water_temp_c: Option<f64>,
    pub air: AirTemperatures,
    pub humidity: Humidity,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Profile bands shown next to the readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub temperature: Band,
    pub humidity: Band,
    pub water_temperature: Band,
}

impl Thresholds {
    pub fn from_profile(p: &Profile) -> Self {
        Self {
            temperature: p.temperature,
            humidity: p.humidity,
            water_temperature: p.water_temperature,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DosingStatus {
    pub running: bool,
    pub phase: Option<DosePump>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub phase_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub plan: Option<DosePlan>,
    pub mixing: bool,
    pub cancelled: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ManualOverride {
    pub on: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

/// Reservoir being emptied and refilled by hand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Renewal {
    #[serde(with = "time::serde::rfc3339")]
    pub began_at: OffsetDateTime,
    /// The run was paused by the renewal and is unpaused when it ends.
    pub paused_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Run,
    Alert,
    Dosing,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse<'a> {
    pub uptime_secs: u64,
    pub running: bool,
    #[serde(flatten)]
    pub status: &'a RuntimeStatus,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeStatus {
    pub fn new() -> Self {
        Self {
            booted_at: StdInstant::now(),
            profile_id: None,
            started_at: None,
            cycle_count: 0,
            paused: false,
            last_error: None,
            actuators: ActuatorStates::default(),
            fan_cause: None,
            timers: PhaseTimers::default(),
            scheduler_phase: None,
            next_window_open: None,
            readings: ClimateReadings::default(),
            thresholds: None,
            reservoir: None,
            alerts: BTreeMap::new(),
            dosing: DosingStatus::default(),
            overrides: BTreeMap::new(),
            renewal: None,
            recoverable: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            kick_requested: false,
            resume: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.profile_id.is_some()
    }

    pub fn any_alert_active(&self) -> bool {
        self.alerts.values().any(|a| a.active)
    }

    /// Reset the run fields for a freshly started profile.
    pub fn begin_run(&mut self, profile: &Profile, started_at: OffsetDateTime) {
        self.profile_id = Some(profile.id.clone());
        self.started_at = Some(started_at);
        self.cycle_count = 0;
        self.paused = false;
        self.thresholds = Some(Thresholds::from_profile(profile));
        self.timers.clear();
        self.scheduler_phase = None;
        self.next_window_open = None;
        self.kick_requested = false;
        self.resume = None;
        self.push_event(EventKind::Run, format!("run started: {}", profile.id));
    }

    /// Clear the run fields once the loop has exited.
    pub fn end_run(&mut self) {
        if let Some(id) = self.profile_id.take() {
            self.push_event(EventKind::Run, format!("run ended: {id}"));
        }
        self.started_at = None;
        self.paused = false;
        self.thresholds = None;
        self.timers.clear();
        self.scheduler_phase = None;
        self.next_window_open = None;
        self.fan_cause = None;
        self.kick_requested = false;
        self.resume = None;
    }

    /// Ask the loop for an out-of-band premix on its next tick.
    pub fn request_kick(&mut self) {
        self.kick_requested = true;
    }

    pub fn take_kick(&mut self) -> bool {
        std::mem::take(&mut self.kick_requested)
    }

    pub fn store_resume(&mut self, snapshot: ResumeSnapshot) {
        self.resume = Some(snapshot);
    }

    /// One-shot: the snapshot is gone after the first call.
    pub fn take_resume(&mut self) -> Option<ResumeSnapshot> {
        self.resume.take()
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_dosing(&mut self, detail: String) {
        self.push_event(EventKind::Dosing, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse<'_> {
        StatusResponse {
            uptime_secs: self.booted_at.elapsed().as_secs(),
            running: self.is_running(),
            status: self,
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
