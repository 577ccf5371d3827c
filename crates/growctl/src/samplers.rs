//! Background sampling workers that run for the life of the process,
//! independent of whether a run is active.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ScaleConfig;
use crate::hardware::{read_climate, read_mass, ClimateSample, Sensors};
use crate::reservoir::ReservoirTracker;
use crate::settings::{GlobalSettings, SettingsStore};
use crate::state::{ClimateReadings, RuntimeStatus, SharedState};

const AMBIENT_PERIOD: Duration = Duration::from_secs(1);

/// Raw load-cell counts to gross reservoir mass.
pub fn counts_to_gross_kg(counts: f64, scale: &ScaleConfig, empty_weight_kg: f64) -> Option<f64> {
    if !counts.is_finite() || scale.counts_per_kg == 0.0 {
        return None;
    }
    let net = ((counts - scale.baseline_counts) / scale.counts_per_kg).max(0.0);
    Some(empty_weight_kg + net)
}

// ---------------------------------------------------------------------------
// Scale sampler
// ---------------------------------------------------------------------------

/// Publish gross reservoir mass every `period_ms`. A failed read keeps the
/// last good value on the channel.
pub async fn run_scale_sampler(
    sensors: Arc<dyn Sensors>,
    scale: ScaleConfig,
    settings: Arc<SettingsStore>,
    tx: watch::Sender<Option<f64>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(scale.period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = scale.period_ms, samples = scale.samples, "scale sampler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let Some(counts) = read_mass(sensors.clone(), scale.samples).await else {
            debug!("scale read failed, holding last value");
            continue;
        };
        let empty = settings.load().reservoir.empty_weight_kg;
        if let Some(kg) = counts_to_gross_kg(counts, &scale, empty) {
            tx.send_replace(Some(kg));
        }
    }
    info!("scale sampler stopped");
}

// ---------------------------------------------------------------------------
// Ambient worker
// ---------------------------------------------------------------------------

/// Keeps readings and reservoir fields live while the control loop is not
/// writing them: no run active, or the run paused.
pub struct Ambient {
    tracker: ReservoirTracker,
}

impl Default for Ambient {
    fn default() -> Self {
        Self::new()
    }
}

impl Ambient {
    pub fn new() -> Self {
        Self {
            tracker: ReservoirTracker::default(),
        }
    }

    /// Returns `false` when the control loop owns the fields this tick.
    pub fn refresh(
        &mut self,
        st: &mut RuntimeStatus,
        sample: &ClimateSample,
        gross_kg: Option<f64>,
        settings: &GlobalSettings,
        now: Instant,
    ) -> bool {
        let idle = !st.is_running();
        if !idle && !st.paused {
            return false;
        }

        st.readings = ClimateReadings {
            temperature_c: sample.air.avg,
            humidity_pct: sample.humidity.avg,
            water_temp_c: sample.water_temp_c,
            air: sample.air,
            humidity: sample.humidity,
            updated_at: Some(OffsetDateTime::now_utc()),
        };
        let report = self
            .tracker
            .update(gross_kg, &settings.reservoir, false, now);

        if idle && st.last_error.is_some() && !st.any_alert_active() && report.below_cutoff != Some(true) {
            debug!("clearing stale error while idle");
            st.last_error = None;
        }
        st.reservoir = Some(report);
        true
    }
}

pub async fn run_ambient(
    status: SharedState,
    sensors: Arc<dyn Sensors>,
    settings: Arc<SettingsStore>,
    scale: watch::Receiver<Option<f64>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ambient = Ambient::new();
    let mut ticker = interval(AMBIENT_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        {
            let st = status.read().await;
            if st.is_running() && !st.paused {
                continue;
            }
        }
        let sample = read_climate(sensors.clone()).await;
        let gross = *scale.borrow();
        let settings = settings.load();
        let mut st = status.write().await;
        ambient.refresh(&mut st, &sample, gross, &settings, Instant::now());
    }
    info!("ambient worker stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::FixedSensors;
    use crate::hardware::{AirTemperatures, Humidity};
    use crate::profile::tests::test_profile;

    fn sample(t: f64, h: f64) -> ClimateSample {
        ClimateSample {
            air: AirTemperatures::from_probes(Some(t), Some(t + 1.0)),
            humidity: Humidity::from_probes(Some(h), None),
            water_temp_c: Some(18.5),
        }
    }

    // -- Conversion ---------------------------------------------------------

    #[test]
    fn counts_convert_to_gross_mass() {
        let scale = ScaleConfig {
            baseline_counts: 1000.0,
            counts_per_kg: 100.0,
            ..ScaleConfig::default()
        };
        assert_eq!(counts_to_gross_kg(4500.0, &scale, 5.0), Some(40.0));
        assert_eq!(counts_to_gross_kg(500.0, &scale, 5.0), Some(5.0), "clamped at empty");
        assert_eq!(counts_to_gross_kg(f64::NAN, &scale, 5.0), None);
    }

    // -- Ambient ------------------------------------------------------------

    #[test]
    fn ambient_fills_readings_while_idle() {
        let mut ambient = Ambient::new();
        let mut st = RuntimeStatus::new();
        let settings = GlobalSettings::default();
        let wrote = ambient.refresh(&mut st, &sample(20.0, 55.0), Some(40.0), &settings, Instant::now());

        assert!(wrote);
        assert_eq!(st.readings.temperature_c, Some(20.5));
        assert_eq!(st.readings.humidity_pct, Some(55.0));
        assert_eq!(st.readings.water_temp_c, Some(18.5));
        assert_eq!(st.reservoir.unwrap().water_raw_kg, Some(35.0));
    }

    #[test]
    fn ambient_leaves_active_run_alone() {
        let mut ambient = Ambient::new();
        let mut st = RuntimeStatus::new();
        let settings = GlobalSettings::default();
        st.begin_run(&test_profile(), OffsetDateTime::now_utc());
        assert!(!ambient.refresh(&mut st, &sample(20.0, 55.0), Some(40.0), &settings, Instant::now()));
        assert!(st.reservoir.is_none());

        st.paused = true;
        assert!(ambient.refresh(&mut st, &sample(20.0, 55.0), Some(40.0), &settings, Instant::now()));
    }

    #[test]
    fn idle_clears_stale_error_unless_reservoir_empty() {
        let settings = GlobalSettings::default();
        let mut ambient = Ambient::new();
        let mut st = RuntimeStatus::new();

        st.last_error = Some("Reservoir 4.00 kg ≤ cutoff 5.00 kg".into());
        ambient.refresh(&mut st, &sample(20.0, 55.0), Some(9.0), &settings, Instant::now());
        assert!(st.last_error.is_some());

        ambient.refresh(&mut st, &sample(20.0, 55.0), Some(40.0), &settings, Instant::now());
        assert!(st.last_error.is_none());
    }

    // -- Workers ------------------------------------------------------------

    #[tokio::test]
    async fn scale_sampler_publishes_and_holds() {
        let sensors = FixedSensors::new(21.0, 50.0);
        let scale = ScaleConfig {
            baseline_counts: 0.0,
            counts_per_kg: 10.0,
            samples: 1,
            period_ms: 50,
        };
        *sensors.mass.lock().unwrap() = Some(300.0);
        let settings = Arc::new(SettingsStore::in_memory(GlobalSettings::default()));
        let (tx, mut rx) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_scale_sampler(sensors.clone(), scale, settings, tx, stop_rx));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(35.0));

        *sensors.mass.lock().unwrap() = None;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*rx.borrow(), Some(35.0), "last good value held");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ambient_worker_updates_idle_status() {
        let status = crate::state::shared(RuntimeStatus::new());
        let sensors = FixedSensors::new(23.0, 61.0);
        let settings = Arc::new(SettingsStore::in_memory(GlobalSettings::default()));
        let (_scale_tx, scale) = watch::channel(Some(30.0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_ambient(status.clone(), sensors, settings, scale, stop_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let st = status.read().await;
            assert_eq!(st.readings.temperature_c, Some(23.0));
            assert_eq!(st.reservoir.as_ref().unwrap().gross_kg, Some(30.0));
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
