//! Hardware ports: the devices the controller drives and the readings it
//! consumes. Drivers sit behind [`Actuators`] and [`Sensors`] so a failing
//! device surfaces as a missing reading or a logged error, never a panic in
//! the control path.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Fan,
    Heater,
    Humidifier,
    MainPump,
    Agitator,
    AirPump,
    NutrientA,
    NutrientB,
}

impl Device {
    pub const ALL: [Device; 8] = [
        Device::Fan,
        Device::Heater,
        Device::Humidifier,
        Device::MainPump,
        Device::Agitator,
        Device::AirPump,
        Device::NutrientA,
        Device::NutrientB,
    ];

    /// Outputs owned by the control loop (everything except the dosing pumps).
    pub const RUN_OUTPUTS: [Device; 6] = [
        Device::MainPump,
        Device::Agitator,
        Device::AirPump,
        Device::Fan,
        Device::Heater,
        Device::Humidifier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Fan => "fan",
            Device::Heater => "heater",
            Device::Humidifier => "humidifier",
            Device::MainPump => "main_pump",
            Device::Agitator => "agitator",
            Device::AirPump => "air_pump",
            Device::NutrientA => "nutrient_a",
            Device::NutrientB => "nutrient_b",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Actuator port
// ---------------------------------------------------------------------------

/// Switches chamber outputs. Implementations serialise access per device and
/// treat a repeated command for the current state as a no-op.
pub trait Actuators: Send + Sync {
    fn set(&self, device: Device, on: bool) -> Result<()>;

    /// Last state actually commanded to the hardware.
    fn is_on(&self, device: Device) -> bool;

    fn all_off(&self) {
        for device in Device::ALL {
            if let Err(e) = self.set(device, false) {
                warn!(device = %device, "failed to switch off: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AirTemperatures {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub avg: Option<f64>,
    /// Top minus bottom, when both probes answered.
    pub gradient: Option<f64>,
}

impl AirTemperatures {
    pub fn from_probes(top: Option<f64>, bottom: Option<f64>) -> Self {
        Self {
            top,
            bottom,
            avg: mean(top, bottom),
            gradient: top.zip(bottom).map(|(t, b)| t - b),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Humidity {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub avg: Option<f64>,
}

impl Humidity {
    pub fn from_probes(top: Option<f64>, bottom: Option<f64>) -> Self {
        Self {
            top,
            bottom,
            avg: mean(top, bottom),
        }
    }
}

fn mean(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// Reads chamber sensors. Every method answers `None` on a transient fault
/// instead of returning an error.
pub trait Sensors: Send + Sync {
    fn read_air_temperatures(&self) -> AirTemperatures;
    fn read_humidity(&self) -> Humidity;
    fn read_water_temperature(&self) -> Option<f64>;
    /// Mean of `count` raw load-cell samples.
    fn read_reservoir_mass_sample(&self, count: usize) -> Option<f64>;
}

/// One pass over every climate sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClimateSample {
    pub air: AirTemperatures,
    pub humidity: Humidity,
    pub water_temp_c: Option<f64>,
}

impl ClimateSample {
    pub fn read(sensors: &dyn Sensors) -> Self {
        Self {
            air: sensors.read_air_temperatures(),
            humidity: sensors.read_humidity(),
            water_temp_c: sensors.read_water_temperature(),
        }
    }
}

/// Read the climate sensors on the blocking pool. A panicking driver yields
/// an empty sample.
pub async fn read_climate(sensors: Arc<dyn Sensors>) -> ClimateSample {
    match tokio::task::spawn_blocking(move || ClimateSample::read(sensors.as_ref())).await {
        Ok(sample) => sample,
        Err(e) => {
            warn!("climate sensor read aborted: {e}");
            ClimateSample::default()
        }
    }
}

/// Read one averaged reservoir mass sample on the blocking pool.
pub async fn read_mass(sensors: Arc<dyn Sensors>, count: usize) -> Option<f64> {
    match tokio::task::spawn_blocking(move || sensors.read_reservoir_mass_sample(count)).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("scale read aborted: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use super::*;
    use anyhow::bail;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Actuator double that records every accepted command and can be told
    /// to reject commands for chosen devices.
    #[derive(Default)]
    pub struct RecordingBoard {
        states: Mutex<HashMap<Device, bool>>,
        history: Mutex<Vec<(Device, bool)>>,
        failing: Mutex<HashSet<Device>>,
    }

    impl RecordingBoard {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn fail(&self, device: Device) {
            self.failing.lock().unwrap().insert(device);
        }

        pub fn history(&self) -> Vec<(Device, bool)> {
            self.history.lock().unwrap().clone()
        }

        pub fn any_on(&self) -> bool {
            self.states.lock().unwrap().values().any(|on| *on)
        }
    }

    impl Actuators for RecordingBoard {
        fn set(&self, device: Device, on: bool) -> Result<()> {
            if self.failing.lock().unwrap().contains(&device) {
                bail!("relay {device} not responding");
            }
            let mut states = self.states.lock().unwrap();
            let prev = states.insert(device, on).unwrap_or(false);
            if prev != on {
                self.history.lock().unwrap().push((device, on));
            }
            Ok(())
        }

        fn is_on(&self, device: Device) -> bool {
            self.states
                .lock()
                .unwrap()
                .get(&device)
                .copied()
                .unwrap_or(false)
        }
    }

    /// Sensor double returning whatever the test last stored.
    #[derive(Default)]
    pub struct FixedSensors {
        pub temperature: Mutex<Option<f64>>,
        pub humidity: Mutex<Option<f64>>,
        pub water_temp: Mutex<Option<f64>>,
        pub mass: Mutex<Option<f64>>,
    }

    impl FixedSensors {
        pub fn new(temperature: f64, humidity: f64) -> Arc<Self> {
            let s = Self::default();
            *s.temperature.lock().unwrap() = Some(temperature);
            *s.humidity.lock().unwrap() = Some(humidity);
            Arc::new(s)
        }
    }

    impl Sensors for FixedSensors {
        fn read_air_temperatures(&self) -> AirTemperatures {
            let t = *self.temperature.lock().unwrap();
            AirTemperatures::from_probes(t, t)
        }

        fn read_humidity(&self) -> Humidity {
            let h = *self.humidity.lock().unwrap();
            Humidity::from_probes(h, h)
        }

        fn read_water_temperature(&self) -> Option<f64> {
            *self.water_temp.lock().unwrap()
        }

        fn read_reservoir_mass_sample(&self, _count: usize) -> Option<f64> {
            *self.mass.lock().unwrap()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn air_temperatures_average_and_gradient() {
        let t = AirTemperatures::from_probes(Some(26.0), Some(22.0));
        assert_eq!(t.avg, Some(24.0));
        assert_eq!(t.gradient, Some(4.0));
    }

    #[test]
    fn single_probe_still_gives_average() {
        let h = Humidity::from_probes(None, Some(61.0));
        assert_eq!(h.avg, Some(61.0));
        let t = AirTemperatures::from_probes(Some(20.0), None);
        assert_eq!(t.avg, Some(20.0));
        assert_eq!(t.gradient, None);
    }

    #[test]
    fn all_off_skips_failing_device() {
        let board = RecordingBoard::new();
        board.set(Device::Fan, true).unwrap();
        board.set(Device::MainPump, true).unwrap();
        board.fail(Device::Heater);

        board.all_off();

        assert!(!board.any_on());
    }

    #[tokio::test]
    async fn read_climate_collects_every_sensor() {
        let sensors = FixedSensors::new(23.5, 55.0);
        *sensors.water_temp.lock().unwrap() = Some(19.0);

        let sample = read_climate(sensors).await;

        assert_eq!(sample.air.avg, Some(23.5));
        assert_eq!(sample.humidity.avg, Some(55.0));
        assert_eq!(sample.water_temp_c, Some(19.0));
    }
}
