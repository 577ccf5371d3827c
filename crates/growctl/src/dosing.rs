//! Nutrient dosing sequencer.
//!
//! Pumps A and B run strictly one after the other under a process-wide
//! sequencing lock. Cancellation never interrupts a pump mid-command: an
//! emergency stop trips the cancel flag and bumps the generation counter,
//! the running phase notices between 5 ms sleep slices, and any work whose
//! captured generation is stale skips every further status write.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::write_json_atomic;
use crate::events::{AuditEvent, EventLog};
use crate::hardware::{Actuators, Device};
use crate::state::{DosingStatus, SharedState};

/// Cancel-aware sleep granularity while a dosing pump runs.
const DOSE_SLICE: Duration = Duration::from_millis(5);

/// Sleep granularity for a manual agitator mix.
const MIX_SLICE: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Pumps & plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DosePump {
    A,
    B,
}

impl DosePump {
    pub fn device(self) -> Device {
        match self {
            DosePump::A => Device::NutrientA,
            DosePump::B => Device::NutrientB,
        }
    }
}

/// Requested millilitres and the run time they translate to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DosePlan {
    pub ml_a: f64,
    pub ml_b: f64,
    pub a_seconds: f64,
    pub b_seconds: f64,
}

impl DosePlan {
    pub fn is_empty(&self) -> bool {
        self.a_seconds <= 0.0 && self.b_seconds <= 0.0
    }
}

/// Run time for `ml` at `ml_per_s`. A missing or zero rate means nothing to do.
pub fn seconds_for(ml: f64, ml_per_s: Option<f64>) -> f64 {
    match ml_per_s {
        Some(rate) if rate > 0.0 && ml > 0.0 => (ml / rate * 1000.0).round() / 1000.0,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpCalibration {
    pub ml_per_s: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub calibrated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(rename = "A", default)]
    pub a: PumpCalibration,
    #[serde(rename = "B", default)]
    pub b: PumpCalibration,
}

impl Calibration {
    pub fn rate(&self, pump: DosePump) -> Option<f64> {
        match pump {
            DosePump::A => self.a.ml_per_s,
            DosePump::B => self.b.ml_per_s,
        }
    }

    pub fn plan(&self, ml_a: f64, ml_b: f64) -> DosePlan {
        DosePlan {
            ml_a,
            ml_b,
            a_seconds: seconds_for(ml_a, self.rate(DosePump::A)),
            b_seconds: seconds_for(ml_b, self.rate(DosePump::B)),
        }
    }
}

/// JSON file holding the measured flow rate of each dosing pump.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means "not calibrated yet".
    pub fn load(&self) -> Result<Calibration> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Calibration::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    /// Store `ml / seconds` as the new rate for `pump` and return it.
    pub fn record(&self, pump: DosePump, ml: f64, seconds: f64) -> Result<f64> {
        if !ml.is_finite() || ml <= 0.0 {
            bail!("calibration volume must be positive, got {ml}");
        }
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("calibration run time must be positive, got {seconds}");
        }
        let mut cal = self.load().unwrap_or_else(|e| {
            warn!("discarding unreadable calibration: {e:#}");
            Calibration::default()
        });
        let rate = ml / seconds;
        let entry = PumpCalibration {
            ml_per_s: Some(rate),
            calibrated_at: Some(OffsetDateTime::now_utc()),
        };
        match pump {
            DosePump::A => cal.a = entry,
            DosePump::B => cal.b = entry,
        }
        write_json_atomic(&self.path, &cal)?;
        info!(?pump, ml_per_s = rate, "dosing pump calibrated");
        Ok(rate)
    }
}

// ---------------------------------------------------------------------------
// Pump guard
// ---------------------------------------------------------------------------

/// Holds one output ON; dropping it switches the output OFF whatever path
/// the owner leaves by.
struct PumpGuard {
    actuators: Arc<dyn Actuators>,
    device: Device,
}

impl PumpGuard {
    fn engage(actuators: Arc<dyn Actuators>, device: Device) -> Result<Self> {
        let guard = Self { actuators, device };
        guard.actuators.set(device, true)?;
        Ok(guard)
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Err(e) = self.actuators.set(self.device, false) {
            error!(device = %self.device, "failed to switch off: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

struct Inner {
    actuators: Arc<dyn Actuators>,
    status: SharedState,
    events: EventLog,
    calibration: CalibrationStore,
    generation: AtomicU64,
    cancel: AtomicBool,
    sequence: Mutex<()>,
}

#[derive(Clone)]
pub struct DosingSequencer {
    inner: Arc<Inner>,
}

impl DosingSequencer {
    pub fn new(
        actuators: Arc<dyn Actuators>,
        status: SharedState,
        events: EventLog,
        calibration: CalibrationStore,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                actuators,
                status,
                events,
                calibration,
                generation: AtomicU64::new(0),
                cancel: AtomicBool::new(false),
                sequence: Mutex::new(()),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.inner.calibration
    }

    /// Plan durations from the current calibration without running anything.
    pub fn plan(&self, ml_a: f64, ml_b: f64) -> DosePlan {
        let cal = self.inner.calibration.load().unwrap_or_else(|e| {
            warn!("calibration unavailable, planning zero run time: {e:#}");
            Calibration::default()
        });
        cal.plan(ml_a, ml_b)
    }

    fn superseded(&self, generation: u64) -> bool {
        self.inner.cancel.load(Ordering::SeqCst) || self.generation() != generation
    }

    /// Start a dose in the background and return the planned durations.
    pub async fn dose(&self, ml_a: f64, ml_b: f64) -> Result<DosePlan> {
        for (name, ml) in [("ml_a", ml_a), ("ml_b", ml_b)] {
            if !ml.is_finite() || ml < 0.0 {
                bail!("{name} must be a non-negative number, got {ml}");
            }
        }
        let plan = self.plan(ml_a, ml_b);
        if plan.is_empty() {
            info!(ml_a, ml_b, "dose planned zero run time, nothing to do");
            return Ok(plan);
        }

        let (generation, profile_id) = {
            let mut st = self.inner.status.write().await;
            if st.dosing.running {
                bail!("a dose is already running");
            }
            self.inner.cancel.store(false, Ordering::SeqCst);
            let generation = self.generation();
            st.dosing.running = true;
            st.dosing.cancelled = false;
            st.dosing.plan = Some(plan);
            st.dosing.started_at = Some(OffsetDateTime::now_utc());
            st.dosing.generation = generation;
            st.record_dosing(format!(
                "dose requested: A {ml_a} ml ({}s), B {ml_b} ml ({}s)",
                plan.a_seconds, plan.b_seconds
            ));
            (generation, st.profile_id.clone())
        };

        info!(ml_a, ml_b, a_s = plan.a_seconds, b_s = plan.b_seconds, "dose queued");
        let this = self.clone();
        tokio::spawn(async move { this.run_dose(plan, generation, profile_id).await });
        Ok(plan)
    }

    async fn run_dose(self, plan: DosePlan, generation: u64, profile_id: Option<String>) {
        let _sequence = self.inner.sequence.lock().await;
        if self.superseded(generation) {
            return;
        }

        let mut completed = true;
        for (pump, secs) in [(DosePump::A, plan.a_seconds), (DosePump::B, plan.b_seconds)] {
            if secs <= 0.0 {
                continue;
            }
            if !self.run_phase(pump, secs, generation).await {
                completed = false;
                break;
            }
        }

        let mut st = self.inner.status.write().await;
        if self.generation() != generation {
            return;
        }
        st.dosing.running = false;
        st.dosing.phase = None;
        st.dosing.phase_started_at = None;
        st.record_dosing(if completed {
            "dose complete".to_string()
        } else {
            "dose aborted".to_string()
        });
        drop(st);

        self.inner.events.log(
            AuditEvent::new(
                "reservoir_dose",
                format!("Dosed A {} ml, B {} ml", plan.ml_a, plan.ml_b),
            )
            .reason(if completed { "complete" } else { "aborted" })
            .profile(profile_id.as_deref())
            .actor("user")
            .payload(json!({
                "ml_a": plan.ml_a,
                "ml_b": plan.ml_b,
                "a_seconds": plan.a_seconds,
                "b_seconds": plan.b_seconds,
                "completed": completed,
            })),
        );
        info!(completed, "dose finished");
    }

    /// Run one pump for `secs`. Returns `false` when cancelled or failed.
    async fn run_phase(&self, pump: DosePump, secs: f64, generation: u64) -> bool {
        let device = pump.device();
        let actuators = &self.inner.actuators;

        let guard = {
            let mut st = self.inner.status.write().await;
            if self.superseded(generation) {
                return false;
            }
            st.dosing.phase = Some(pump);
            st.dosing.phase_started_at = Some(OffsetDateTime::now_utc());
            st.actuators.set(device, true);
            match PumpGuard::engage(actuators.clone(), device) {
                Ok(g) => g,
                Err(e) => {
                    warn!(%device, "dosing pump failed to start: {e:#}");
                    st.actuators.set(device, actuators.is_on(device));
                    st.record_error(format!("{device} failed to start: {e}"));
                    return false;
                }
            }
        };

        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        loop {
            if self.superseded(generation) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(DOSE_SLICE)).await;
        }
        drop(guard);

        let completed = !self.superseded(generation);
        let mut st = self.inner.status.write().await;
        st.actuators.set(device, actuators.is_on(device));
        if self.generation() == generation {
            st.dosing.phase = None;
            st.dosing.phase_started_at = None;
        }
        completed
    }

    /// Cut both dosing pumps now and invalidate every queued or running
    /// dose. Returns the new generation.
    pub async fn emergency_stop(&self) -> u64 {
        self.inner.cancel.store(true, Ordering::SeqCst);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let actuators = &self.inner.actuators;
        for pump in [DosePump::A, DosePump::B] {
            if let Err(e) = actuators.set(pump.device(), false) {
                error!(device = %pump.device(), "emergency stop: {e:#}");
            }
        }

        let profile_id = {
            let mut st = self.inner.status.write().await;
            // A phase that was mid-start when the flag flipped has now
            // released the lock; switch again so nothing survives.
            for pump in [DosePump::A, DosePump::B] {
                let _ = actuators.set(pump.device(), false);
                st.actuators.set(pump.device(), actuators.is_on(pump.device()));
            }
            if st.dosing.mixing {
                let _ = actuators.set(Device::Agitator, false);
                st.actuators.agitator = actuators.is_on(Device::Agitator);
            }
            st.dosing = DosingStatus {
                cancelled: true,
                generation,
                ..DosingStatus::default()
            };
            st.record_dosing("emergency stop".to_string());
            st.profile_id.clone()
        };

        warn!(generation, "nutrient emergency stop");
        self.inner.events.log(
            AuditEvent::new("nutrient_emergency_stop", "Nutrient dosing emergency stop")
                .profile(profile_id.as_deref())
                .actor("user")
                .payload(json!({ "generation": generation })),
        );
        generation
    }

    /// Run the agitator for `seconds` in the background. Aborted by any
    /// generation change.
    pub async fn mix(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("mix duration must be positive, got {seconds}");
        }
        let generation = self.generation();
        {
            let mut st = self.inner.status.write().await;
            if st.dosing.mixing {
                bail!("a mix is already running");
            }
            st.dosing.mixing = true;
        }
        info!(seconds, "manual mix started");
        let this = self.clone();
        tokio::spawn(async move { this.run_mix(seconds, generation).await });
        Ok(())
    }

    async fn run_mix(self, seconds: f64, generation: u64) {
        let actuators = &self.inner.actuators;
        let device = Device::Agitator;

        let guard = {
            let mut st = self.inner.status.write().await;
            if self.generation() != generation {
                return;
            }
            st.actuators.set(device, true);
            match PumpGuard::engage(actuators.clone(), device) {
                Ok(g) => Some(g),
                Err(e) => {
                    warn!("agitator failed to start: {e:#}");
                    st.actuators.set(device, actuators.is_on(device));
                    st.record_error(format!("agitator failed to start: {e}"));
                    None
                }
            }
        };

        let started = Instant::now();
        let deadline = started + Duration::from_secs_f64(seconds);
        if guard.is_some() {
            while self.generation() == generation {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep((deadline - now).min(MIX_SLICE)).await;
            }
        }
        drop(guard);
        let ran_s = started.elapsed().as_secs_f64();

        let profile_id = {
            let mut st = self.inner.status.write().await;
            st.actuators.set(device, actuators.is_on(device));
            if self.generation() != generation {
                return;
            }
            st.dosing.mixing = false;
            st.profile_id.clone()
        };
        self.inner.events.log(
            AuditEvent::new("reservoir_mix", format!("Agitator mix {seconds:.0}s"))
                .profile(profile_id.as_deref())
                .actor("user")
                .payload(json!({ "requested_s": seconds, "ran_s": ran_s })),
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::RecordingBoard;
    use crate::state::{shared, RuntimeStatus};

    fn scratch(name: &str) -> CalibrationStore {
        let dir = std::env::temp_dir().join(format!("growctl-dosing-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        CalibrationStore::new(dir.join("nutrient_cal.json"))
    }

    fn sequencer(name: &str, rate_a: f64, rate_b: f64) -> (DosingSequencer, Arc<RecordingBoard>, SharedState, EventLog) {
        let cal = scratch(name);
        if rate_a > 0.0 {
            cal.record(DosePump::A, rate_a, 1.0).unwrap();
        }
        if rate_b > 0.0 {
            cal.record(DosePump::B, rate_b, 1.0).unwrap();
        }
        let board = RecordingBoard::new();
        let status = shared(RuntimeStatus::new());
        let events = EventLog::new();
        let seq = DosingSequencer::new(board.clone(), status.clone(), events.clone(), cal);
        (seq, board, status, events)
    }

    async fn wait_until_idle(status: &SharedState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let st = status.read().await;
                    if !st.dosing.running && !st.dosing.mixing {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dosing did not finish");
    }

    // -- Planning --------------------------------------------------------

    #[test]
    fn seconds_for_handles_missing_rate() {
        assert_eq!(seconds_for(10.0, None), 0.0);
        assert_eq!(seconds_for(10.0, Some(0.0)), 0.0);
        assert_eq!(seconds_for(0.0, Some(2.0)), 0.0);
        assert_eq!(seconds_for(10.0, Some(3.0)), 3.333);
    }

    #[test]
    fn calibration_record_and_reload() {
        let cal = scratch("record");
        assert_eq!(cal.load().unwrap(), Calibration::default());

        let rate = cal.record(DosePump::B, 12.0, 4.0).unwrap();
        assert_eq!(rate, 3.0);

        let loaded = cal.load().unwrap();
        assert_eq!(loaded.rate(DosePump::B), Some(3.0));
        assert_eq!(loaded.rate(DosePump::A), None);
        assert!(loaded.b.calibrated_at.is_some());
    }

    #[test]
    fn calibration_rejects_zero_duration() {
        let cal = scratch("reject");
        let err = cal.record(DosePump::A, 10.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("run time must be positive"));
    }

    // -- Dosing ----------------------------------------------------------

    #[tokio::test]
    async fn dose_runs_a_then_b() {
        // 1 ml/s on A, 2 ml/s on B.
        let (seq, board, status, events) = sequencer("sequence", 1.0, 2.0);

        let plan = seq.dose(0.1, 0.2).await.unwrap();
        assert_eq!(plan.a_seconds, 0.1);
        assert_eq!(plan.b_seconds, 0.1);

        wait_until_idle(&status).await;
        assert_eq!(
            board.history(),
            vec![
                (Device::NutrientA, true),
                (Device::NutrientA, false),
                (Device::NutrientB, true),
                (Device::NutrientB, false),
            ]
        );
        let st = status.read().await;
        assert!(!st.actuators.nutrient_a && !st.actuators.nutrient_b);
        assert_eq!(st.dosing.phase, None);
        let logged = events.pending();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, "reservoir_dose");
    }

    #[tokio::test]
    async fn second_dose_rejected_while_first_runs() {
        let (seq, board, status, events) = sequencer("overlap", 1.0, 1.0);

        seq.dose(0.1, 0.0).await.unwrap();
        let err = seq.dose(0.4, 0.0).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        {
            let st = status.read().await;
            assert!(!board.is_on(Device::NutrientA));
            assert!(!st.dosing.running);
            assert_eq!(st.dosing.phase, None);
        }
        assert_eq!(
            board.history(),
            vec![(Device::NutrientA, true), (Device::NutrientA, false)]
        );
        assert_eq!(events.pending().len(), 1);

        seq.dose(0.05, 0.0).await.unwrap();
        wait_until_idle(&status).await;
        assert!(!board.any_on());
    }

    #[tokio::test]
    async fn uncalibrated_dose_is_a_no_op() {
        let (seq, board, status, _events) = sequencer("uncalibrated", 0.0, 0.0);

        let plan = seq.dose(5.0, 5.0).await.unwrap();

        assert!(plan.is_empty());
        assert!(board.history().is_empty());
        assert!(!status.read().await.dosing.running);
    }

    #[tokio::test]
    async fn negative_volume_rejected() {
        let (seq, _board, _status, _events) = sequencer("negative", 1.0, 1.0);
        let err = seq.dose(-1.0, 0.0).await.unwrap_err();
        assert!(err.to_string().contains("ml_a"));
    }

    #[tokio::test]
    async fn emergency_stop_leaves_nothing_on() {
        let (seq, board, status, events) = sequencer("estop", 1.0, 1.0);

        seq.dose(30.0, 30.0).await.unwrap();
        let captured = status.read().await.dosing.generation;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(board.is_on(Device::NutrientA));

        let generation = seq.emergency_stop().await;

        assert!(!board.any_on());
        assert!(generation > captured);
        {
            let st = status.read().await;
            assert!(!st.actuators.nutrient_a);
            assert!(st.dosing.cancelled);
            assert!(!st.dosing.running);
        }

        // The aborted dose must not write anything after the stop.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!board.any_on());
        assert!(!board.history().contains(&(Device::NutrientB, true)));
        let st = status.read().await;
        assert!(st.dosing.cancelled);
        assert_eq!(st.dosing.generation, generation);
        let kinds: Vec<_> = events.pending().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["nutrient_emergency_stop"]);
    }

    #[tokio::test]
    async fn dose_after_stop_runs_again() {
        let (seq, board, status, _events) = sequencer("restart", 1.0, 1.0);
        seq.dose(30.0, 0.0).await.unwrap();
        seq.emergency_stop().await;

        seq.dose(0.05, 0.0).await.unwrap();
        wait_until_idle(&status).await;

        let ons = board
            .history()
            .into_iter()
            .filter(|h| *h == (Device::NutrientA, true))
            .count();
        assert!(ons >= 1);
        assert!(!board.any_on());
        assert!(!status.read().await.dosing.cancelled);
    }

    #[tokio::test]
    async fn failing_pump_aborts_without_leaving_it_on() {
        let (seq, board, status, _events) = sequencer("failing", 1.0, 1.0);
        board.fail(Device::NutrientA);

        seq.dose(0.1, 0.1).await.unwrap();
        wait_until_idle(&status).await;

        assert!(!board.any_on());
        assert!(board.history().is_empty(), "B never starts after A failed");
        let st = status.read().await;
        assert!(!st.actuators.nutrient_a);
        assert!(st.last_error.is_none());
    }

    // -- Mixing ----------------------------------------------------------

    #[tokio::test]
    async fn mix_runs_agitator_for_duration() {
        let (seq, board, status, events) = sequencer("mix", 0.0, 0.0);

        seq.mix(0.1).await.unwrap();
        wait_until_idle(&status).await;

        assert_eq!(
            board.history(),
            vec![(Device::Agitator, true), (Device::Agitator, false)]
        );
        assert_eq!(events.pending()[0].kind, "reservoir_mix");
    }

    #[tokio::test]
    async fn emergency_stop_aborts_mix() {
        let (seq, board, status, _events) = sequencer("mix-stop", 0.0, 0.0);

        seq.mix(30.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(board.is_on(Device::Agitator));

        seq.emergency_stop().await;
        assert!(!board.any_on());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let st = status.read().await;
        assert!(!st.dosing.mixing);
        assert!(!st.actuators.agitator);
    }
}
