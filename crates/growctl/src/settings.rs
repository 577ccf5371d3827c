//! Process-wide tunables persisted as JSON. The control loop reads a cached
//! snapshot and asks the store to re-read the file every few seconds; a
//! malformed file never replaces the snapshot already in memory.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::config::write_json_atomic;

// ---------------------------------------------------------------------------
// Settings structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub hysteresis: Hysteresis,
    pub min_on: MinOnTimes,
    pub limits: HardLimits,
    pub reservoir: ReservoirSettings,
    pub premix: PremixConfig,
    pub alerts: AlertSettings,
    /// Default duration of a manual reservoir mix.
    pub agitator_mix_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hysteresis {
    pub temp_c: f64,
    pub humidity_pct: f64,
    pub heater_c: Option<f64>,
    pub fan_temp_c: Option<f64>,
    pub humidifier_pct: Option<f64>,
    pub fan_humidity_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinOnTimes {
    pub heater_s: f64,
    pub fan_s: f64,
}

/// Absolute safety limits. Crossing one halts every output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardLimits {
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub humidity_min_pct: f64,
    pub humidity_max_pct: f64,
    pub water_temp_min_c: Option<f64>,
    pub water_temp_max_c: Option<f64>,
    /// Recovery margins; `None` falls back to the general hysteresis.
    pub temp_hyst_c: Option<f64>,
    pub humidity_hyst_pct: Option<f64>,
    pub water_temp_hyst_c: Option<f64>,
}

/// Reservoir geometry and level thresholds, all in kg of net water.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirSettings {
    pub empty_weight_kg: f64,
    pub full_capacity_kg: f64,
    pub half_kg: f64,
    pub low_kg: f64,
    pub critical_kg: f64,
    pub cutoff_kg: f64,
    pub full_margin_kg: f64,
    pub hysteresis_kg: f64,
    pub smoothing_tau_s: f64,
    pub snap_delta_kg: f64,
    /// Round net water to this step before smoothing; 0 disables.
    pub water_quantum_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PremixConfig {
    pub agitator_enabled: bool,
    pub agitator_run_s: f64,
    pub air_pump_enabled: bool,
    pub air_pump_run_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub cooldown_s: f64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            hysteresis: Hysteresis::default(),
            min_on: MinOnTimes::default(),
            limits: HardLimits::default(),
            reservoir: ReservoirSettings::default(),
            premix: PremixConfig::default(),
            alerts: AlertSettings::default(),
            agitator_mix_s: 30.0,
        }
    }
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            temp_c: 0.5,
            humidity_pct: 3.0,
            heater_c: None,
            fan_temp_c: None,
            humidifier_pct: None,
            fan_humidity_pct: None,
        }
    }
}

impl Default for MinOnTimes {
    fn default() -> Self {
        Self {
            heater_s: 30.0,
            fan_s: 15.0,
        }
    }
}

impl Default for HardLimits {
    fn default() -> Self {
        Self {
            temp_min_c: 5.0,
            temp_max_c: 40.0,
            humidity_min_pct: 10.0,
            humidity_max_pct: 95.0,
            water_temp_min_c: None,
            water_temp_max_c: None,
            temp_hyst_c: None,
            humidity_hyst_pct: None,
            water_temp_hyst_c: None,
        }
    }
}

impl Default for ReservoirSettings {
    fn default() -> Self {
        Self {
            empty_weight_kg: 5.0,
            full_capacity_kg: 60.0,
            half_kg: 30.0,
            low_kg: 15.0,
            critical_kg: 6.0,
            cutoff_kg: 5.0,
            full_margin_kg: 1.0,
            hysteresis_kg: 0.5,
            smoothing_tau_s: 8.0,
            snap_delta_kg: 0.25,
            water_quantum_kg: 0.0,
        }
    }
}

impl Default for PremixConfig {
    fn default() -> Self {
        Self {
            agitator_enabled: false,
            agitator_run_s: 15.0,
            air_pump_enabled: false,
            air_pump_run_s: 0.0,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self { cooldown_s: 300.0 }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl GlobalSettings {
    pub fn alert_cooldown(&self) -> Duration {
        seconds(self.alerts.cooldown_s)
    }

    pub fn temp_recovery_margin(&self) -> f64 {
        self.limits.temp_hyst_c.unwrap_or(self.hysteresis.temp_c)
    }

    pub fn humidity_recovery_margin(&self) -> f64 {
        self.limits
            .humidity_hyst_pct
            .unwrap_or(self.hysteresis.humidity_pct)
    }

    pub fn water_temp_recovery_margin(&self) -> f64 {
        self.limits.water_temp_hyst_c.unwrap_or(self.hysteresis.temp_c)
    }
}

/// Convert a configured number of seconds into a `Duration`. Non-finite or
/// non-positive values mean "no time at all".
pub fn seconds(s: f64) -> Duration {
    if s.is_finite() && s > 0.0 {
        Duration::from_secs_f64(s.min(1.0e9))
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl GlobalSettings {
    /// Validate every field. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── Hysteresis and minimum-on ────────────────────────────
        let h = &self.hysteresis;
        non_negative(&mut errors, "hysteresis.temp_c", h.temp_c);
        non_negative(&mut errors, "hysteresis.humidity_pct", h.humidity_pct);
        for (name, v) in [
            ("hysteresis.heater_c", h.heater_c),
            ("hysteresis.fan_temp_c", h.fan_temp_c),
            ("hysteresis.humidifier_pct", h.humidifier_pct),
            ("hysteresis.fan_humidity_pct", h.fan_humidity_pct),
            ("limits.temp_hyst_c", self.limits.temp_hyst_c),
            ("limits.humidity_hyst_pct", self.limits.humidity_hyst_pct),
            ("limits.water_temp_hyst_c", self.limits.water_temp_hyst_c),
        ] {
            if let Some(v) = v {
                non_negative(&mut errors, name, v);
            }
        }
        non_negative(&mut errors, "min_on.heater_s", self.min_on.heater_s);
        non_negative(&mut errors, "min_on.fan_s", self.min_on.fan_s);

        // ── Hard limits ──────────────────────────────────────────
        let l = &self.limits;
        if l.temp_min_c >= l.temp_max_c {
            errors.push(format!(
                "limits.temp_min_c ({}) must be below limits.temp_max_c ({})",
                l.temp_min_c, l.temp_max_c
            ));
        }
        if l.humidity_min_pct >= l.humidity_max_pct {
            errors.push(format!(
                "limits.humidity_min_pct ({}) must be below limits.humidity_max_pct ({})",
                l.humidity_min_pct, l.humidity_max_pct
            ));
        }
        if !(0.0..=100.0).contains(&l.humidity_min_pct) || !(0.0..=100.0).contains(&l.humidity_max_pct)
        {
            errors.push("limits.humidity_*_pct must be within [0, 100]".to_string());
        }
        if let (Some(lo), Some(hi)) = (l.water_temp_min_c, l.water_temp_max_c) {
            if lo >= hi {
                errors.push(format!(
                    "limits.water_temp_min_c ({lo}) must be below limits.water_temp_max_c ({hi})"
                ));
            }
        }

        // ── Reservoir ────────────────────────────────────────────
        let r = &self.reservoir;
        non_negative(&mut errors, "reservoir.empty_weight_kg", r.empty_weight_kg);
        non_negative(&mut errors, "reservoir.full_margin_kg", r.full_margin_kg);
        non_negative(&mut errors, "reservoir.hysteresis_kg", r.hysteresis_kg);
        non_negative(&mut errors, "reservoir.smoothing_tau_s", r.smoothing_tau_s);
        non_negative(&mut errors, "reservoir.snap_delta_kg", r.snap_delta_kg);
        non_negative(&mut errors, "reservoir.water_quantum_kg", r.water_quantum_kg);
        non_negative(&mut errors, "reservoir.cutoff_kg", r.cutoff_kg);
        if r.full_capacity_kg <= 0.0 {
            errors.push(format!(
                "reservoir.full_capacity_kg must be positive, got {}",
                r.full_capacity_kg
            ));
        }
        let ladder = [
            ("cutoff_kg", r.cutoff_kg),
            ("critical_kg", r.critical_kg),
            ("low_kg", r.low_kg),
            ("half_kg", r.half_kg),
            ("full_capacity_kg", r.full_capacity_kg),
        ];
        for pair in ladder.windows(2) {
            let ((a_name, a), (b_name, b)) = (pair[0], pair[1]);
            if a > b {
                errors.push(format!(
                    "reservoir.{a_name} ({a}) must not exceed reservoir.{b_name} ({b})"
                ));
            }
        }

        // ── Premix and alerts ────────────────────────────────────
        non_negative(&mut errors, "premix.agitator_run_s", self.premix.agitator_run_s);
        non_negative(&mut errors, "premix.air_pump_run_s", self.premix.air_pump_run_s);
        non_negative(&mut errors, "alerts.cooldown_s", self.alerts.cooldown_s);
        non_negative(&mut errors, "agitator_mix_s", self.agitator_mix_s);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn non_negative(errors: &mut Vec<String>, name: &str, v: f64) {
    if !v.is_finite() || v < 0.0 {
        errors.push(format!("{name} must be a non-negative number, got {v}"));
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Cached {
    settings: Arc<GlobalSettings>,
    modified: Option<SystemTime>,
}

/// File-backed settings with an in-memory snapshot.
pub struct SettingsStore {
    path: PathBuf,
    cache: RwLock<Cached>,
}

impl SettingsStore {
    /// Open the store. A missing file is created with defaults; an
    /// unreadable one is moved aside to `*.corrupt` and defaults are used.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            match read_settings(&path) {
                Ok(s) => s,
                Err(e) => {
                    let mut backup = path.as_os_str().to_owned();
                    backup.push(".corrupt");
                    warn!(path = %path.display(), "settings unreadable, using defaults: {e:#}");
                    fs::rename(&path, &backup).with_context(|| {
                        format!("failed to move aside {}", path.display())
                    })?;
                    let defaults = GlobalSettings::default();
                    write_json_atomic(&path, &defaults)?;
                    defaults
                }
            }
        } else {
            info!(path = %path.display(), "settings file not found, writing defaults");
            let defaults = GlobalSettings::default();
            write_json_atomic(&path, &defaults)?;
            defaults
        };

        let modified = modified_time(&path);
        Ok(Self {
            path,
            cache: RwLock::new(Cached {
                settings: Arc::new(settings),
                modified,
            }),
        })
    }

    /// Store that never touches the disk. Used where no file is wanted.
    pub fn in_memory(settings: GlobalSettings) -> Self {
        Self {
            path: PathBuf::new(),
            cache: RwLock::new(Cached {
                settings: Arc::new(settings),
                modified: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<GlobalSettings> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&cache.settings)
    }

    /// Re-read the file if it changed on disk. Returns `true` when a new
    /// snapshot was installed. A bad file keeps the previous snapshot.
    pub fn refresh(&self) -> bool {
        if self.path.as_os_str().is_empty() {
            return false;
        }
        let modified = modified_time(&self.path);
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if modified.is_none() || modified == cache.modified {
                return false;
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.modified = modified;
        match read_settings(&self.path) {
            Ok(settings) => {
                if *cache.settings != settings {
                    info!(path = %self.path.display(), "settings reloaded");
                    cache.settings = Arc::new(settings);
                    return true;
                }
                false
            }
            Err(e) => {
                warn!(path = %self.path.display(), "settings reload skipped: {e:#}");
                false
            }
        }
    }

    /// Validate and persist new settings, then install them.
    pub fn save(&self, settings: GlobalSettings) -> Result<()> {
        settings.validate()?;
        if !self.path.as_os_str().is_empty() {
            write_json_atomic(&self.path, &settings)?;
        }
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.settings = Arc::new(settings);
        cache.modified = modified_time(&self.path);
        Ok(())
    }
}

fn read_settings(path: &Path) -> Result<GlobalSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {}", path.display()))?;
    let settings: GlobalSettings = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse settings: {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("growctl-settings-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn assert_validation_err(s: &GlobalSettings, needle: &str) {
        let msg = format!("{:#}", s.validate().unwrap_err());
        assert!(msg.contains(needle), "expected {needle:?}, got: {msg}");
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn empty_object_yields_defaults() {
        let s: GlobalSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, GlobalSettings::default());
        assert_eq!(s.reservoir.cutoff_kg, 5.0);
        assert_eq!(s.alerts.cooldown_s, 300.0);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let s: GlobalSettings =
            serde_json::from_str(r#"{"hysteresis": {"heater_c": 1.0}, "limits": {"temp_max_c": 35}}"#)
                .unwrap();
        assert_eq!(s.hysteresis.heater_c, Some(1.0));
        assert_eq!(s.hysteresis.temp_c, 0.5);
        assert_eq!(s.limits.temp_max_c, 35.0);
        assert_eq!(s.limits.temp_min_c, 5.0);
    }

    #[test]
    fn recovery_margins_fall_back_to_general_bands() {
        let mut s = GlobalSettings::default();
        assert_eq!(s.temp_recovery_margin(), 0.5);
        assert_eq!(s.humidity_recovery_margin(), 3.0);
        s.limits.temp_hyst_c = Some(2.0);
        assert_eq!(s.temp_recovery_margin(), 2.0);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn defaults_pass() {
        GlobalSettings::default().validate().unwrap();
    }

    #[test]
    fn reservoir_ladder_out_of_order_rejected() {
        let mut s = GlobalSettings::default();
        s.reservoir.low_kg = 40.0;
        assert_validation_err(&s, "reservoir.low_kg (40) must not exceed reservoir.half_kg (30)");
    }

    #[test]
    fn cutoff_above_critical_rejected() {
        let mut s = GlobalSettings::default();
        s.reservoir.cutoff_kg = 7.0;
        assert_validation_err(&s, "reservoir.cutoff_kg");
    }

    #[test]
    fn inverted_hard_limits_rejected() {
        let mut s = GlobalSettings::default();
        s.limits.temp_min_c = 45.0;
        assert_validation_err(&s, "limits.temp_min_c (45) must be below");
    }

    #[test]
    fn water_temperature_order_checked_when_both_set() {
        let mut s = GlobalSettings::default();
        s.limits.water_temp_min_c = Some(25.0);
        s.validate().unwrap();
        s.limits.water_temp_max_c = Some(20.0);
        assert_validation_err(&s, "limits.water_temp_min_c");
    }

    #[test]
    fn negative_hysteresis_rejected() {
        let mut s = GlobalSettings::default();
        s.hysteresis.fan_temp_c = Some(-1.0);
        assert_validation_err(&s, "hysteresis.fan_temp_c must be a non-negative number");
    }

    #[test]
    fn seconds_clamps_bad_input() {
        assert_eq!(seconds(-3.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
    }

    // -- Store --------------------------------------------------------------

    #[test]
    fn open_writes_defaults_when_missing() {
        let dir = scratch("missing");
        let path = dir.join("global_settings.json");
        let store = SettingsStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(*store.load(), GlobalSettings::default());
    }

    #[test]
    fn open_moves_corrupt_file_aside() {
        let dir = scratch("corrupt");
        let path = dir.join("global_settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::open(&path).unwrap();

        assert!(dir.join("global_settings.json.corrupt").exists());
        assert_eq!(*store.load(), GlobalSettings::default());
    }

    #[test]
    fn save_rejects_invalid_and_keeps_snapshot() {
        let dir = scratch("save");
        let store = SettingsStore::open(dir.join("s.json")).unwrap();
        let mut bad = GlobalSettings::default();
        bad.limits.humidity_min_pct = 99.0;
        assert!(store.save(bad).is_err());
        assert_eq!(store.load().limits.humidity_min_pct, 10.0);
    }

    #[test]
    fn refresh_skips_invalid_file() {
        let dir = scratch("refresh-bad");
        let path = dir.join("s.json");
        let store = SettingsStore::open(&path).unwrap();

        // Force an mtime change the store has not seen.
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&path, r#"{"limits": {"temp_min_c": 50, "temp_max_c": 10}}"#).unwrap();
        store.cache.write().unwrap().modified = None;

        assert!(!store.refresh());
        assert_eq!(store.load().limits.temp_min_c, 5.0);
    }

    #[test]
    fn refresh_installs_changed_file() {
        let dir = scratch("refresh-ok");
        let path = dir.join("s.json");
        let store = SettingsStore::open(&path).unwrap();

        fs::write(&path, r#"{"alerts": {"cooldown_s": 60}}"#).unwrap();
        store.cache.write().unwrap().modified = None;

        assert!(store.refresh());
        assert_eq!(store.load().alerts.cooldown_s, 60.0);
    }
}
