//! Run lifecycle and the request surfaces exposed to the HTTP layer.
//!
//! Every request either writes into the shared status record (picked up by
//! the control loop on its next tick) or delegates to the dosing sequencer.
//! Rejections come back as `Err` and never touch an actuator.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::{self, all_run_outputs_off, LoopContext, RunSignal};
use crate::dosing::{DosePlan, DosePump, DosingSequencer};
use crate::events::AuditEvent;
use crate::hardware::Device;
use crate::profile::Profile;
use crate::recovery::Checkpoint;
use crate::settings::GlobalSettings;
use crate::state::{ManualOverride, Renewal, SharedState};

struct ActiveRun {
    signal: watch::Sender<RunSignal>,
    task: JoinHandle<()>,
}

pub struct Controller {
    ctx: LoopContext,
    dosing: DosingSequencer,
    run: Mutex<Option<ActiveRun>>,
}

impl Controller {
    pub fn new(ctx: LoopContext, dosing: DosingSequencer) -> Self {
        Self {
            ctx,
            dosing,
            run: Mutex::new(None),
        }
    }

    pub fn status(&self) -> &SharedState {
        &self.ctx.status
    }

    fn lifecycle(&self, action: &str, profile_id: Option<&str>, payload: serde_json::Value) {
        self.ctx.events.log(
            AuditEvent::new("profile_lifecycle", format!("Profile {action}"))
                .reason(action)
                .profile(profile_id)
                .actor("user")
                .payload(payload),
        );
    }

    fn spawn_loop(&self, slot: &mut Option<ActiveRun>, profile: Profile) {
        let (signal, rx) = watch::channel(RunSignal::Run);
        let task = tokio::spawn(control::run(self.ctx.clone(), profile, rx));
        *slot = Some(ActiveRun { signal, task });
    }

    async fn save_checkpoint(&self) {
        let cp = Checkpoint::from_status(&*self.ctx.status.read().await);
        if let Some(cp) = cp {
            if let Err(e) = self.ctx.checkpoints.save(&cp) {
                warn!("checkpoint not saved: {e:#}");
            }
        }
    }

    // -- Run lifecycle ------------------------------------------------------

    pub async fn start(&self, profile_id: &str) -> Result<()> {
        let mut slot = self.run.lock().await;
        if let Some(active) = self.ctx.status.read().await.profile_id.clone() {
            bail!("profile '{active}' is already running");
        }
        let profile = self.ctx.profiles.load(profile_id)?;

        {
            let mut st = self.ctx.status.write().await;
            st.begin_run(&profile, OffsetDateTime::now_utc());
            st.recoverable = None;
            st.last_error = None;
            st.request_kick();
        }
        self.save_checkpoint().await;
        self.spawn_loop(&mut slot, profile);

        let settings = self.ctx.settings.load();
        info!(profile = profile_id, "run started");
        self.lifecycle("start", Some(profile_id), json!({}));
        self.ctx.events.log(
            AuditEvent::new("settings_snapshot", "Global settings at run start")
                .profile(Some(profile_id))
                .actor("system")
                .payload(serde_json::to_value(&*settings).unwrap_or_default()),
        );
        self.ctx.notifier.notify(format!("▶️ Run started: {profile_id}"));
        Ok(())
    }

    /// Stop the run. Returns once the loop has switched everything off.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.run.lock().await;
        let Some(active) = slot.take() else {
            bail!("no run is active");
        };
        let profile_id = self.ctx.status.read().await.profile_id.clone();
        let _ = active.signal.send(RunSignal::Stop);
        if let Err(e) = active.task.await {
            warn!("control loop ended abnormally: {e}");
            let mut st = self.ctx.status.write().await;
            all_run_outputs_off(&mut st, self.ctx.actuators.as_ref());
            st.end_run();
            if let Err(e) = self.ctx.checkpoints.clear() {
                warn!("checkpoint not cleared: {e:#}");
            }
        }

        info!(profile = ?profile_id, "run stopped");
        self.lifecycle("stop", profile_id.as_deref(), json!({}));
        self.ctx
            .notifier
            .notify(format!("⏹️ Run stopped: {}", profile_id.as_deref().unwrap_or("-")));
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let profile_id = {
            let mut st = self.ctx.status.write().await;
            if !st.is_running() {
                bail!("no run is active");
            }
            if st.paused {
                bail!("run is already paused");
            }
            st.paused = true;
            all_run_outputs_off(&mut st, self.ctx.actuators.as_ref());
            st.profile_id.clone()
        };
        info!("run paused");
        self.lifecycle("pause", profile_id.as_deref(), json!({}));
        Ok(())
    }

    /// Clear the pause flag. With `kick`, also request a premix so the
    /// reservoir is stirred before the pump restarts.
    pub async fn unpause(&self, kick: bool) -> Result<()> {
        let profile_id = {
            let mut st = self.ctx.status.write().await;
            if !st.paused {
                bail!("run is not paused");
            }
            st.paused = false;
            if kick {
                st.request_kick();
            }
            st.profile_id.clone()
        };
        info!(kick, "run unpaused");
        self.lifecycle("unpause", profile_id.as_deref(), json!({ "kick": kick }));
        Ok(())
    }

    pub async fn kick(&self) -> Result<()> {
        let mut st = self.ctx.status.write().await;
        if !st.is_running() {
            bail!("no run is active");
        }
        st.request_kick();
        info!("premix kick requested");
        Ok(())
    }

    // -- Manual control -------------------------------------------------------

    /// Hold a run output on or off by hand until released, or until a pause,
    /// stop or hard-limit alert drops every override.
    pub async fn set_override(&self, device: Device, on: bool) -> Result<bool> {
        if !Device::RUN_OUTPUTS.contains(&device) {
            bail!("{device} is driven by the dosing sequencer");
        }
        let (actual, held_s, profile_id) = {
            let mut st = self.ctx.status.write().await;
            if st.any_alert_active() {
                bail!("a hard-limit alert is active");
            }
            let now = OffsetDateTime::now_utc();
            let previous = st.overrides.insert(device, ManualOverride { on, since: now });
            let actual = control::drive(&mut st, self.ctx.actuators.as_ref(), device, on);
            let held_s = previous.map(|p| (now - p.since).as_seconds_f64());
            (actual, held_s, st.profile_id.clone())
        };
        let state = if on { "ON" } else { "OFF" };
        info!(%device, on, actual, "manual override");
        self.ctx.events.log(
            AuditEvent::new("actuator_change", format!("{device} {state} via manual override"))
                .reason(if on { "manual_on" } else { "manual_off" })
                .profile(profile_id.as_deref())
                .actor("manual_override")
                .payload(json!({
                    "device": device,
                    "after_state": on,
                    "actual": actual,
                    "held_s": held_s,
                })),
        );
        Ok(actual)
    }

    /// Hand the output back. Without a run driving it, it is switched off.
    pub async fn clear_override(&self, device: Device) -> Result<()> {
        let (held_s, profile_id) = {
            let mut st = self.ctx.status.write().await;
            let Some(held) = st.overrides.remove(&device) else {
                bail!("{device} is not overridden");
            };
            if !st.is_running() || st.paused {
                control::drive(&mut st, self.ctx.actuators.as_ref(), device, false);
            }
            let held_s = (OffsetDateTime::now_utc() - held.since).as_seconds_f64();
            (held_s, st.profile_id.clone())
        };
        info!(%device, held_s, "manual override released");
        self.ctx.events.log(
            AuditEvent::new("actuator_change", format!("{device} released from manual override"))
                .reason("manual_release")
                .profile(profile_id.as_deref())
                .actor("manual_override")
                .payload(json!({ "device": device, "held_s": held_s })),
        );
        Ok(())
    }

    // -- Reservoir renewal ----------------------------------------------------

    /// Pause an unpaused run while the reservoir is emptied and refilled.
    pub async fn begin_renewal(&self) -> Result<()> {
        let (paused_run, profile_id) = {
            let mut st = self.ctx.status.write().await;
            if st.renewal.is_some() {
                bail!("reservoir renewal already in progress");
            }
            let paused_run = st.is_running() && !st.paused;
            if paused_run {
                st.paused = true;
                all_run_outputs_off(&mut st, self.ctx.actuators.as_ref());
            }
            st.renewal = Some(Renewal {
                began_at: OffsetDateTime::now_utc(),
                paused_run,
            });
            st.record_system("reservoir renewal started".to_string());
            (paused_run, st.profile_id.clone())
        };
        info!(paused_run, "reservoir renewal started");
        self.ctx.events.log(
            AuditEvent::new("reservoir_renewal", "Reservoir renewal: BEGIN")
                .reason("begin")
                .profile(profile_id.as_deref())
                .actor("user")
                .payload(json!({ "paused_run": paused_run })),
        );
        Ok(())
    }

    /// Finish a renewal. A run it paused is unpaused with a premix kick so
    /// the fresh solution is stirred before the pump restarts.
    pub async fn end_renewal(&self) -> Result<()> {
        let (resumed, duration_s, profile_id) = {
            let mut st = self.ctx.status.write().await;
            let Some(renewal) = st.renewal.take() else {
                bail!("no reservoir renewal in progress");
            };
            let resumed = renewal.paused_run && st.is_running() && st.paused;
            if resumed {
                st.paused = false;
                st.request_kick();
            }
            st.record_system("reservoir renewal finished".to_string());
            let duration_s = (OffsetDateTime::now_utc() - renewal.began_at).as_seconds_f64();
            (resumed, duration_s, st.profile_id.clone())
        };
        info!(resumed, duration_s, "reservoir renewal finished");
        self.ctx.events.log(
            AuditEvent::new("reservoir_renewal", "Reservoir renewal: END")
                .reason("end")
                .profile(profile_id.as_deref())
                .actor("user")
                .payload(json!({ "resumed": resumed, "duration_s": duration_s })),
        );
        if resumed {
            self.ctx.notifier.notify("🔁 Reservoir renewed: run resumed with premix");
        }
        Ok(())
    }

    // -- Crash recovery -----------------------------------------------------

    /// Restart the run recorded in the checkpoint. A run that was irrigating
    /// when the process died gets a premix kick before the pump restarts.
    pub async fn resume_from_checkpoint(&self) -> Result<()> {
        let mut slot = self.run.lock().await;
        if self.ctx.status.read().await.is_running() {
            bail!("a run is already active");
        }
        let Some(cp) = self.ctx.checkpoints.load() else {
            bail!("no checkpoint to resume");
        };
        let profile = self
            .ctx
            .profiles
            .load(&cp.profile_id)
            .with_context(|| format!("resuming profile '{}'", cp.profile_id))?;
        let crash_recovery = cp.was_mid_cycle();

        {
            let mut st = self.ctx.status.write().await;
            st.begin_run(&profile, cp.started_at.unwrap_or_else(OffsetDateTime::now_utc));
            st.cycle_count = cp.cycle_count;
            st.paused = cp.paused;
            st.recoverable = None;
            if crash_recovery {
                st.request_kick();
            }
        }
        if let Err(e) = self.ctx.checkpoints.clear() {
            warn!("checkpoint not cleared: {e:#}");
        }
        self.spawn_loop(&mut slot, profile);

        info!(profile = %cp.profile_id, crash_recovery, "run resumed from checkpoint");
        self.lifecycle(
            "resume",
            Some(&cp.profile_id),
            json!({
                "cycle_count": cp.cycle_count,
                "paused": cp.paused,
                "crash_recovery": crash_recovery,
                "saved_at": cp.saved_at.unix_timestamp(),
            }),
        );
        Ok(())
    }

    /// Surface a checkpoint left by a previous process as recoverable.
    /// Returns `true` when one was found.
    pub async fn detect_checkpoint(&self) -> bool {
        let Some(cp) = self.ctx.checkpoints.load() else {
            return false;
        };
        info!(
            path = %self.ctx.checkpoints.path().display(),
            profile = %cp.profile_id,
            cycle_count = cp.cycle_count,
            mid_cycle = cp.was_mid_cycle(),
            "recoverable run found"
        );
        let mut st = self.ctx.status.write().await;
        st.record_system(format!("recoverable run: {}", cp.profile_id));
        st.recoverable = Some(cp);
        true
    }

    pub async fn dismiss_checkpoint(&self) -> Result<()> {
        self.ctx.checkpoints.clear()?;
        self.ctx.status.write().await.recoverable = None;
        info!("checkpoint dismissed");
        Ok(())
    }

    // -- Settings & profiles ------------------------------------------------

    pub fn settings(&self) -> Arc<GlobalSettings> {
        self.ctx.settings.load()
    }

    /// Validate and persist new global settings, then install them.
    pub fn save_settings(&self, settings: GlobalSettings) -> Result<()> {
        let payload = serde_json::to_value(&settings).unwrap_or_default();
        self.ctx.settings.save(settings)?;
        info!("global settings saved");
        self.ctx.events.log(
            AuditEvent::new("settings_snapshot", "Global settings updated")
                .actor("user")
                .payload(payload),
        );
        Ok(())
    }

    pub fn profiles(&self) -> Result<Vec<String>> {
        self.ctx.profiles.list()
    }

    // -- Dosing -------------------------------------------------------------

    pub async fn dose(&self, ml_a: f64, ml_b: f64) -> Result<DosePlan> {
        self.dosing.dose(ml_a, ml_b).await
    }

    /// Dose the active profile's ratios for `litres`, or for the current net
    /// water when not given (1 kg of water taken as 1 L).
    pub async fn dose_for_litres(&self, litres: Option<f64>) -> Result<DosePlan> {
        let (profile_id, water_kg) = {
            let st = self.ctx.status.read().await;
            (
                st.profile_id.clone(),
                st.reservoir.as_ref().and_then(|r| r.water_smoothed_kg),
            )
        };
        let Some(profile_id) = profile_id else {
            bail!("no run is active");
        };
        let Some(litres) = litres.or(water_kg) else {
            bail!("reservoir volume unknown; pass litres explicitly");
        };
        let profile = self.ctx.profiles.load(&profile_id)?;
        let (ml_a, ml_b) = profile.nutrients.dose_for(litres);
        info!(litres, ml_a, ml_b, "dosing for reservoir volume");
        self.dosing.dose(ml_a, ml_b).await
    }

    pub async fn emergency_stop(&self) -> u64 {
        self.dosing.emergency_stop().await
    }

    pub async fn mix(&self, seconds: Option<f64>) -> Result<()> {
        {
            let st = self.ctx.status.read().await;
            if st.is_running() && !st.paused {
                bail!("pause the run before mixing");
            }
        }
        let seconds = seconds.unwrap_or(self.ctx.settings.load().agitator_mix_s);
        self.dosing.mix(seconds).await
    }

    pub fn record_calibration(&self, pump: DosePump, ml: f64, seconds: f64) -> Result<f64> {
        self.dosing.calibration().record(pump, ml, seconds)
    }

    // -- Process exit -------------------------------------------------------

    /// Stop dosing and the loop, keeping the checkpoint, then drive every
    /// output off.
    pub async fn shutdown(&self) {
        self.dosing.emergency_stop().await;
        if let Some(active) = self.run.lock().await.take() {
            let _ = active.signal.send(RunSignal::Shutdown);
            if let Err(e) = active.task.await {
                warn!("control loop ended abnormally: {e}");
            }
        }
        self.ctx.actuators.all_off();
        let mut st = self.ctx.status.write().await;
        st.overrides.clear();
        for device in Device::ALL {
            st.actuators.set(device, self.ctx.actuators.is_on(device));
        }
        st.record_system("shutdown: all outputs off".to_string());
        info!("controller shut down");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
