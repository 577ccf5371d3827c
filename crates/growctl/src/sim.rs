//! Stateful chamber simulator for running without sensor hardware.
//!
//! Models:
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading probe noise and a fixed top/bottom stratification
//! - Occasional dropped readings (flaky probes)
//! - Closed-loop response to the relay board: heater warms, fan cools and
//!   dries, humidifier moistens, main pump drains, dosing pumps add mass

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ScaleConfig;
use crate::hardware::{Actuators, AirTemperatures, Device, Humidity, Sensors};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation presets selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild room, low noise, no dropouts.
    Stable,
    /// Warm room that pulls the chamber toward the fan threshold.
    Hot,
    /// Noisy probes that drop ~10% of readings.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "flaky" => Self::Flaky,
            _ => Self::Stable,
        }
    }

    /// `(ambient °C, ambient %RH, noise sigma, dropout probability)`
    fn params(self) -> (f64, f64, f64, f32) {
        match self {
            Scenario::Stable => (21.0, 55.0, 0.05, 0.0),
            Scenario::Hot => (31.0, 48.0, 0.08, 0.005),
            Scenario::Flaky => (21.0, 55.0, 0.4, 0.10),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Hot => write!(f, "hot"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Chamber physics
// ---------------------------------------------------------------------------

const HEATER_C_PER_S: f64 = 0.04;
const FAN_C_PER_S: f64 = 0.03;
const FAN_RH_PER_S: f64 = 0.15;
const HUMIDIFIER_RH_PER_S: f64 = 0.25;
const PUMP_DRAIN_KG_PER_S: f64 = 0.02;
const DOSING_KG_PER_S: f64 = 0.002;
/// Fraction of the gap to ambient closed per second.
const REVERSION_PER_S: f64 = 0.002;
/// Top probe reads this much warmer than the bottom one.
const STRATIFICATION_C: f64 = 0.6;

#[derive(Debug, Clone)]
struct Chamber {
    air_c: f64,
    humidity_pct: f64,
    water_c: f64,
    water_kg: f64,
}

/// Simulated sensors reacting to whatever the relay board is doing.
pub struct SimulatedChamber {
    state: Mutex<(Chamber, Instant)>,
    board: Arc<dyn Actuators>,
    scale: ScaleConfig,
    ambient_c: f64,
    ambient_rh: f64,
    noise: f64,
    dropout: f32,
}

impl SimulatedChamber {
    pub fn new(scenario: Scenario, board: Arc<dyn Actuators>, scale: ScaleConfig, water_kg: f64) -> Self {
        let (ambient_c, ambient_rh, noise, dropout) = scenario.params();
        let chamber = Chamber {
            air_c: ambient_c + gaussian(0.0, 0.5),
            humidity_pct: ambient_rh + gaussian(0.0, 2.0),
            water_c: 19.0,
            water_kg: water_kg.max(0.0),
        };
        Self {
            state: Mutex::new((chamber, Instant::now())),
            board,
            scale,
            ambient_c,
            ambient_rh,
            noise,
            dropout,
        }
    }

    /// Advance the physics by `dt_s` seconds.
    fn evolve(&self, c: &mut Chamber, dt_s: f64) {
        let on = |d: Device| if self.board.is_on(d) { 1.0 } else { 0.0 };
        let pull = (REVERSION_PER_S * dt_s).min(1.0);

        c.air_c += pull * (self.ambient_c - c.air_c)
            + dt_s * (HEATER_C_PER_S * on(Device::Heater) - FAN_C_PER_S * on(Device::Fan))
            + gaussian(0.0, 0.01 * dt_s.sqrt());
        c.humidity_pct += pull * (self.ambient_rh - c.humidity_pct)
            + dt_s
                * (HUMIDIFIER_RH_PER_S * on(Device::Humidifier) - FAN_RH_PER_S * on(Device::Fan))
            + gaussian(0.0, 0.05 * dt_s.sqrt());
        c.humidity_pct = c.humidity_pct.clamp(0.0, 100.0);
        c.water_c += pull * (c.air_c - 2.0 - c.water_c);
        c.water_kg = (c.water_kg
            + dt_s
                * (DOSING_KG_PER_S * (on(Device::NutrientA) + on(Device::NutrientB))
                    - PUMP_DRAIN_KG_PER_S * on(Device::MainPump)))
            .max(0.0);
    }

    fn snapshot(&self) -> Chamber {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let (chamber, last) = &mut *guard;
        let now = Instant::now();
        let dt = now.saturating_duration_since(*last).as_secs_f64();
        *last = now;
        self.evolve(chamber, dt);
        chamber.clone()
    }

    /// Noisy probe reading, or `None` when the probe drops out.
    fn probe(&self, value: f64) -> Option<f64> {
        if fastrand::f32() < self.dropout {
            None
        } else {
            Some(gaussian(value, self.noise))
        }
    }

    #[cfg(test)]
    fn advance(&self, dt_s: f64) {
        let mut guard = self.state.lock().unwrap();
        self.evolve(&mut guard.0, dt_s);
    }
}

impl Sensors for SimulatedChamber {
    fn read_air_temperatures(&self) -> AirTemperatures {
        let c = self.snapshot();
        AirTemperatures::from_probes(
            self.probe(c.air_c + STRATIFICATION_C / 2.0),
            self.probe(c.air_c - STRATIFICATION_C / 2.0),
        )
    }

    fn read_humidity(&self) -> Humidity {
        let c = self.snapshot();
        Humidity::from_probes(self.probe(c.humidity_pct), self.probe(c.humidity_pct))
    }

    fn read_water_temperature(&self) -> Option<f64> {
        self.probe(self.snapshot().water_c)
    }

    /// Raw load-cell counts for the reservoir's net water mass.
    fn read_reservoir_mass_sample(&self, count: usize) -> Option<f64> {
        if count == 0 || fastrand::f32() < self.dropout {
            return None;
        }
        let water = self.snapshot().water_kg;
        let sum: f64 = (0..count)
            .map(|_| self.scale.baseline_counts + gaussian(water, 0.01) * self.scale.counts_per_kg)
            .sum();
        Some(sum / count as f64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
