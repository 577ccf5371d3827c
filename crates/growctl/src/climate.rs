//! Climate regulation: fan, heater and humidifier decisions from the
//! current readings, the profile bands and the hysteresis settings.
//!
//! [`regulate`] is pure. The caller feeds back what the hardware actually
//! did through [`ClimateMemory::commit`], which also tracks the on-since
//! timestamps behind the minimum-on rules.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::profile::Profile;
use crate::settings::{seconds, GlobalSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FanCause {
    Temperature,
    Humidity,
}

/// Thresholds taken from the active profile. `None` disables that rule.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClimateTargets {
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub humidity_min: Option<f64>,
    pub humidity_max: Option<f64>,
}

impl ClimateTargets {
    pub fn from_profile(p: &Profile) -> Self {
        Self {
            temp_min: p.temperature.min,
            temp_max: p.temperature.max,
            humidity_min: p.humidity.min,
            humidity_max: p.humidity.max,
        }
    }
}

/// Hysteresis margins and minimum-on times per actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateTuning {
    pub heater_hyst_c: f64,
    pub fan_temp_hyst_c: f64,
    pub humidifier_hyst_pct: f64,
    pub fan_humidity_hyst_pct: f64,
    pub fan_min_on: Duration,
    pub heater_min_on: Duration,
}

impl ClimateTuning {
    pub fn from_settings(s: &GlobalSettings) -> Self {
        let h = &s.hysteresis;
        Self {
            heater_hyst_c: h.heater_c.unwrap_or(h.temp_c),
            fan_temp_hyst_c: h.fan_temp_c.unwrap_or(h.temp_c),
            humidifier_hyst_pct: h.humidifier_pct.unwrap_or(h.humidity_pct),
            fan_humidity_hyst_pct: h.fan_humidity_pct.unwrap_or(h.humidity_pct),
            fan_min_on: seconds(s.min_on.fan_s),
            heater_min_on: seconds(s.min_on.heater_s),
        }
    }
}

/// What the three climate outputs were doing after the previous tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClimateMemory {
    pub fan_on: bool,
    pub fan_on_since: Option<Instant>,
    pub fan_cause: Option<FanCause>,
    pub heater_on: bool,
    pub heater_on_since: Option<Instant>,
    pub humidifier_on: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClimateDecision {
    pub fan: bool,
    pub heater: bool,
    pub humidifier: bool,
    pub fan_cause: Option<FanCause>,
}

impl ClimateMemory {
    /// Record the states the hardware ended up in.
    pub fn commit(&mut self, fan: bool, heater: bool, humidifier: bool, cause: Option<FanCause>, now: Instant) {
        if fan && !self.fan_on {
            self.fan_on_since = Some(now);
        }
        if !fan {
            self.fan_on_since = None;
        }
        self.fan_cause = if fan { cause.or(self.fan_cause) } else { None };
        self.fan_on = fan;

        if heater && !self.heater_on {
            self.heater_on_since = Some(now);
        }
        if !heater {
            self.heater_on_since = None;
        }
        self.heater_on = heater;
        self.humidifier_on = humidifier;
    }
}

fn held_by_min_on(on: bool, since: Option<Instant>, min_on: Duration, now: Instant) -> bool {
    on && since.is_some_and(|t| now.saturating_duration_since(t) < min_on)
}

/// Decide the three climate outputs. Missing temperature or humidity forces
/// everything off.
pub fn regulate(
    temp_c: Option<f64>,
    humidity_pct: Option<f64>,
    targets: &ClimateTargets,
    tuning: &ClimateTuning,
    memory: &ClimateMemory,
    now: Instant,
) -> ClimateDecision {
    let (Some(t), Some(h)) = (temp_c, humidity_pct) else {
        return ClimateDecision::default();
    };

    // ── Fan ──────────────────────────────────────────────────
    let temp_high = targets.temp_max.is_some_and(|max| t > max);
    let temp_clear = targets
        .temp_max
        .map_or(true, |max| t < max - tuning.fan_temp_hyst_c);
    let hum_high = targets.humidity_max.is_some_and(|max| h > max);
    let hum_clear = targets
        .humidity_max
        .map_or(true, |max| h < max - tuning.fan_humidity_hyst_pct);

    let (mut fan, mut fan_cause) = if temp_high || hum_high {
        let cause = if memory.fan_on && memory.fan_cause.is_some() {
            memory.fan_cause
        } else if temp_high {
            Some(FanCause::Temperature)
        } else {
            Some(FanCause::Humidity)
        };
        (true, cause)
    } else if temp_clear && hum_clear {
        (false, None)
    } else {
        (memory.fan_on, memory.fan_cause)
    };
    if !fan && held_by_min_on(memory.fan_on, memory.fan_on_since, tuning.fan_min_on, now) {
        fan = true;
        fan_cause = memory.fan_cause;
    }

    // ── Heater ───────────────────────────────────────────────
    let mut heater = match targets.temp_min {
        Some(min) if t < min => true,
        Some(min) if t >= min + tuning.heater_hyst_c => false,
        Some(_) => memory.heater_on,
        None => false,
    };
    if !heater
        && held_by_min_on(memory.heater_on, memory.heater_on_since, tuning.heater_min_on, now)
    {
        heater = true;
    }

    // ── Humidifier ───────────────────────────────────────────
    let humidifier = match targets.humidity_min {
        Some(min) if h < min => true,
        Some(min) if h >= min + tuning.humidifier_hyst_pct => false,
        Some(_) => memory.humidifier_on,
        None => false,
    };

    ClimateDecision {
        fan,
        heater,
        humidifier,
        fan_cause: if fan { fan_cause } else { None },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
