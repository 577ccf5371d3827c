//! Reservoir level estimation from load-cell mass.
//!
//! Raw gross mass is converted to net water, smoothed by an exponential
//! moving average and classified into a fill level with hysteresis:
//!
//! ```text
//! critical ─[w > critical + h]─▶ low ─[w > low + h]─▶ half ─[w > half + h]─▶ ok
//!    ◀────────[w <= critical]──────◀───[w <= low]──────◀───[w <= half]─────┘
//! ```
//!
//! `full` short-circuits everything once water reaches capacity minus the
//! full margin.

use serde::Serialize;
use tokio::time::Instant;

use crate::settings::ReservoirSettings;

// ---------------------------------------------------------------------------
// EMA filter
// ---------------------------------------------------------------------------

/// Exponential moving average with time constant `tau_s`. The smoothing
/// factor adapts to the actual interval between samples.
#[derive(Debug, Clone)]
pub struct Ema {
    tau_s: f64,
    value: Option<f64>,
    last: Option<Instant>,
}

impl Ema {
    pub fn new(tau_s: f64) -> Self {
        Self {
            tau_s,
            value: None,
            last: None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn set_tau(&mut self, tau_s: f64) {
        self.tau_s = tau_s;
    }

    pub fn update(&mut self, x: f64, now: Instant) -> f64 {
        let next = match (self.value, self.last) {
            (Some(v), Some(last)) if self.tau_s > 0.0 => {
                let dt = now.saturating_duration_since(last).as_secs_f64();
                let alpha = 1.0 - (-dt / self.tau_s).exp();
                v + alpha * (x - v)
            }
            _ => x,
        };
        self.value = Some(next);
        self.last = Some(now);
        next
    }

    /// Snap to `x` without averaging.
    pub fn force(&mut self, x: f64, now: Instant) -> f64 {
        self.value = Some(x);
        self.last = Some(now);
        x
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservoirLevel {
    Full,
    Ok,
    Half,
    Low,
    Critical,
}

impl ReservoirLevel {
    /// 0 = ok (or full), 3 = critical.
    pub fn severity(self) -> u8 {
        match self {
            ReservoirLevel::Full | ReservoirLevel::Ok => 0,
            ReservoirLevel::Half => 1,
            ReservoirLevel::Low => 2,
            ReservoirLevel::Critical => 3,
        }
    }

    /// Upper bound of this level; leaving it upwards needs this plus the
    /// hysteresis margin.
    fn boundary(self, s: &ReservoirSettings) -> Option<f64> {
        match self {
            ReservoirLevel::Half => Some(s.half_kg),
            ReservoirLevel::Low => Some(s.low_kg),
            ReservoirLevel::Critical => Some(s.critical_kg),
            ReservoirLevel::Full | ReservoirLevel::Ok => None,
        }
    }
}

/// Hysteretic classification of a smoothed net-water value.
pub fn classify(
    water_kg: f64,
    prev: Option<ReservoirLevel>,
    s: &ReservoirSettings,
) -> ReservoirLevel {
    if s.full_capacity_kg > 0.0 && water_kg >= s.full_capacity_kg - s.full_margin_kg {
        return ReservoirLevel::Full;
    }

    let target = if water_kg <= s.critical_kg {
        ReservoirLevel::Critical
    } else if water_kg <= s.low_kg {
        ReservoirLevel::Low
    } else if water_kg <= s.half_kg {
        ReservoirLevel::Half
    } else {
        ReservoirLevel::Ok
    };

    let prev = match prev {
        None | Some(ReservoirLevel::Ok) | Some(ReservoirLevel::Full) => return target,
        Some(p) => p,
    };

    if target.severity() >= prev.severity() {
        // Worse (or unchanged) levels apply immediately.
        return target;
    }

    match prev.boundary(s) {
        Some(boundary) if water_kg > boundary + s.hysteresis_kg => target,
        _ => prev,
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReservoirDebug {
    pub empty_kg: f64,
    pub full_kg: f64,
    pub usable_kg: f64,
    pub half_kg: f64,
    pub low_kg: f64,
    pub critical_kg: f64,
    pub full_margin_kg: f64,
    pub raw_kg: f64,
    pub smoothed_kg: f64,
    pub pump_on: bool,
}

/// One evaluation. Every field is `None` when the scale gave no reading.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReservoirReport {
    pub gross_kg: Option<f64>,
    pub water_raw_kg: Option<f64>,
    pub water_smoothed_kg: Option<f64>,
    pub level: Option<ReservoirLevel>,
    pub below_cutoff: Option<bool>,
    /// Value compared against the cutoff (the smoothed water).
    pub below_cutoff_value: Option<f64>,
    pub debug: Option<ReservoirDebug>,
}

/// Per-reservoir estimator state.
#[derive(Debug, Clone)]
pub struct ReservoirTracker {
    ema: Ema,
    last_raw: Option<f64>,
    level: Option<ReservoirLevel>,
}

impl Default for ReservoirTracker {
    fn default() -> Self {
        Self::new(ReservoirSettings::default().smoothing_tau_s)
    }
}

impl ReservoirTracker {
    pub fn new(tau_s: f64) -> Self {
        Self {
            ema: Ema::new(tau_s),
            last_raw: None,
            level: None,
        }
    }

    pub fn level(&self) -> Option<ReservoirLevel> {
        self.level
    }

    pub fn update(
        &mut self,
        raw_gross_kg: Option<f64>,
        s: &ReservoirSettings,
        pump_running: bool,
        now: Instant,
    ) -> ReservoirReport {
        let Some(gross) = raw_gross_kg.filter(|g| g.is_finite()) else {
            return ReservoirReport::default();
        };
        self.ema.set_tau(s.smoothing_tau_s);

        let mut water = (gross - s.empty_weight_kg).max(0.0);
        if s.water_quantum_kg > 0.0 {
            water = (water / s.water_quantum_kg).round() * s.water_quantum_kg;
        }

        let stepped = self
            .last_raw
            .is_some_and(|prev| (water - prev).abs() > s.snap_delta_kg);
        let smoothed = if pump_running || stepped {
            self.ema.force(water, now)
        } else {
            self.ema.update(water, now)
        };
        self.last_raw = Some(water);

        let level = classify(smoothed, self.level, s);
        self.level = Some(level);

        ReservoirReport {
            gross_kg: Some(gross),
            water_raw_kg: Some(water),
            water_smoothed_kg: Some(smoothed),
            level: Some(level),
            below_cutoff: Some(smoothed <= s.cutoff_kg),
            below_cutoff_value: Some(smoothed),
            debug: Some(ReservoirDebug {
                empty_kg: s.empty_weight_kg,
                full_kg: s.empty_weight_kg + s.full_capacity_kg,
                usable_kg: s.full_capacity_kg,
                half_kg: s.half_kg,
                low_kg: s.low_kg,
                critical_kg: s.critical_kg,
                full_margin_kg: s.full_margin_kg,
                raw_kg: water,
                smoothed_kg: smoothed,
                pump_on: pump_running,
            }),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
