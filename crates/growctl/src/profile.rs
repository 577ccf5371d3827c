//! Grow profiles: one JSON file per profile in the profiles directory. A
//! running profile is re-read whenever its file's modification time moves
//! forward; an invalid edit is ignored and the previous profile stays live.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::config::write_json_atomic;
use crate::scheduler::HourWindow;
use crate::settings::PremixConfig;

// ---------------------------------------------------------------------------
// Profile structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Filled from the file name when absent.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub temperature: Band,
    #[serde(default)]
    pub humidity: Band,
    #[serde(default)]
    pub water_temperature: Band,
    pub pump: PumpTiming,
    #[serde(default)]
    pub window: HourWindow,
    /// Overrides the global premix defaults when present.
    #[serde(default)]
    pub premix: Option<PremixConfig>,
    #[serde(default)]
    pub nutrients: Nutrients,
}

/// Min/target/max band for one measured quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: Option<f64>,
    pub target: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpTiming {
    pub on_s: f64,
    pub off_s: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrients {
    #[serde(default)]
    pub a: NutrientRatio,
    #[serde(default)]
    pub b: NutrientRatio,
}

/// `ml` of concentrate for every `per_litres` of water.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NutrientRatio {
    pub ml: f64,
    pub per_litres: f64,
}

impl Default for NutrientRatio {
    fn default() -> Self {
        Self {
            ml: 0.0,
            per_litres: 1.0,
        }
    }
}

impl NutrientRatio {
    pub fn ml_per_litre(&self) -> f64 {
        if self.per_litres > 0.0 {
            self.ml / self.per_litres
        } else {
            0.0
        }
    }
}

impl Nutrients {
    /// Millilitres of A and B for `litres` of water.
    pub fn dose_for(&self, litres: f64) -> (f64, f64) {
        let litres = litres.max(0.0);
        (
            round2(self.a.ml_per_litre() * litres),
            round2(self.b.ml_per_litre() * litres),
        )
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Profile {
    pub fn premix(&self, defaults: &PremixConfig) -> PremixConfig {
        self.premix.clone().unwrap_or_else(|| defaults.clone())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Profile {
    /// Validate the profile. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id is empty".to_string());
        } else if !is_safe_id(&self.id) {
            errors.push(format!(
                "id '{}' may only contain letters, digits, '-' and '_'",
                self.id
            ));
        }

        // ── Bands ────────────────────────────────────────────────
        check_band(&mut errors, "temperature", &self.temperature);
        check_band(&mut errors, "humidity", &self.humidity);
        check_band(&mut errors, "water_temperature", &self.water_temperature);

        // ── Pump timing ──────────────────────────────────────────
        for (name, v) in [("pump.on_s", self.pump.on_s), ("pump.off_s", self.pump.off_s)] {
            if !v.is_finite() {
                errors.push(format!("{name} must be finite"));
            }
        }

        // ── Window ───────────────────────────────────────────────
        for (name, h) in [
            ("window.start_hour", self.window.start_hour),
            ("window.end_hour", self.window.end_hour),
        ] {
            if let Some(h) = h {
                if h > 23 {
                    errors.push(format!("{name} {h} out of range [0, 23]"));
                }
            }
        }
        if self.window.start_hour.is_some() != self.window.end_hour.is_some() {
            errors.push("window needs both start_hour and end_hour".to_string());
        }

        // ── Premix ───────────────────────────────────────────────
        if let Some(p) = &self.premix {
            if !non_negative(p.agitator_run_s) || !non_negative(p.air_pump_run_s) {
                errors.push("premix run seconds must be non-negative".to_string());
            }
        }

        // ── Nutrients ────────────────────────────────────────────
        for (name, r) in [("nutrients.a", self.nutrients.a), ("nutrients.b", self.nutrients.b)] {
            if !non_negative(r.ml) {
                errors.push(format!("{name}.ml must be non-negative, got {}", r.ml));
            }
            if !r.per_litres.is_finite() || r.per_litres <= 0.0 {
                errors.push(format!(
                    "{name}.per_litres must be positive, got {}",
                    r.per_litres
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "profile validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn check_band(errors: &mut Vec<String>, name: &str, band: &Band) {
    if let (Some(lo), Some(hi)) = (band.min, band.max) {
        if lo > hi {
            errors.push(format!("{name}.min ({lo}) must not exceed {name}.max ({hi})"));
        }
    }
    if let Some(t) = band.target {
        if band.min.is_some_and(|lo| t < lo) || band.max.is_some_and(|hi| t > hi) {
            errors.push(format!("{name}.target ({t}) lies outside [min, max]"));
        }
    }
}

fn non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

fn is_safe_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Read and validate one profile.
    pub fn load(&self, id: &str) -> Result<Profile> {
        if !is_safe_id(id) {
            bail!("invalid profile id '{id}'");
        }
        read_profile(&self.path_for(id), id)
    }

    pub fn save(&self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        write_json_atomic(&self.path_for(&profile.id), profile)
    }

    /// Ids of every profile file in the directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn read_profile(path: &Path, id: &str) -> Result<Profile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read profile: {}", path.display()))?;
    let mut profile: Profile = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse profile: {}", path.display()))?;
    if profile.id.is_empty() {
        profile.id = id.to_string();
    }
    profile
        .validate()
        .with_context(|| format!("invalid profile: {}", path.display()))?;
    Ok(profile)
}

/// Holds the live profile of a run and swaps in newer file contents.
pub struct ProfileWatcher {
    path: PathBuf,
    profile: Profile,
    modified: Option<SystemTime>,
}

impl ProfileWatcher {
    pub fn new(store: &ProfileStore, profile: Profile) -> Self {
        let path = store.path_for(&profile.id);
        let modified = modified_time(&path);
        Self {
            path,
            profile,
            modified,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Re-read the file if its modification time advanced. Returns `true`
    /// when a new profile was installed.
    pub fn poll(&mut self) -> bool {
        let modified = modified_time(&self.path);
        let advanced = match (modified, self.modified) {
            (Some(now), Some(seen)) => now > seen,
            (Some(_), None) => true,
            _ => false,
        };
        if !advanced {
            return false;
        }
        self.modified = modified;

        match read_profile(&self.path, &self.profile.id) {
            Ok(profile) if profile != self.profile => {
                info!(profile = %profile.id, "profile reloaded");
                self.profile = profile;
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(profile = %self.profile.id, "profile reload skipped: {e:#}");
                false
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_profile() -> Profile {
        Profile {
            id: "basil".into(),
            name: "Basil".into(),
            temperature: Band {
                min: Some(18.0),
                target: Some(22.0),
                max: Some(26.0),
            },
            humidity: Band {
                min: Some(50.0),
                target: Some(60.0),
                max: Some(70.0),
            },
            water_temperature: Band::default(),
            pump: PumpTiming {
                on_s: 10.0,
                off_s: 20.0,
            },
            window: HourWindow::default(),
            premix: None,
            nutrients: Nutrients {
                a: NutrientRatio {
                    ml: 2.0,
                    per_litres: 1.0,
                },
                b: NutrientRatio {
                    ml: 3.0,
                    per_litres: 2.0,
                },
            },
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("growctl-profile-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn assert_validation_err(p: &Profile, needle: &str) {
        let msg = format!("{:#}", p.validate().unwrap_err());
        assert!(msg.contains(needle), "expected {needle:?}, got: {msg}");
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_profile() {
        let p: Profile = serde_json::from_str(r#"{"pump": {"on_s": 60, "off_s": 900}}"#).unwrap();
        assert_eq!(p.pump.on_s, 60.0);
        assert_eq!(p.window, HourWindow::default());
        assert!(p.premix.is_none());
        assert_eq!(p.nutrients.a.ml_per_litre(), 0.0);
    }

    #[test]
    fn premix_override_wins_over_defaults() {
        let mut p = test_profile();
        let defaults = PremixConfig::default();
        assert_eq!(p.premix(&defaults), defaults);

        let custom = PremixConfig {
            air_pump_enabled: true,
            air_pump_run_s: 20.0,
            ..PremixConfig::default()
        };
        p.premix = Some(custom.clone());
        assert_eq!(p.premix(&defaults), custom);
    }

    #[test]
    fn dose_for_scales_ratios() {
        let p = test_profile();
        assert_eq!(p.nutrients.dose_for(10.0), (20.0, 15.0));
        assert_eq!(p.nutrients.dose_for(-5.0), (0.0, 0.0));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_profile_passes() {
        test_profile().validate().unwrap();
    }

    #[test]
    fn inverted_band_rejected() {
        let mut p = test_profile();
        p.humidity.min = Some(80.0);
        assert_validation_err(&p, "humidity.min (80) must not exceed humidity.max (70)");
    }

    #[test]
    fn target_outside_band_rejected() {
        let mut p = test_profile();
        p.temperature.target = Some(30.0);
        assert_validation_err(&p, "temperature.target (30) lies outside");
    }

    #[test]
    fn window_hour_out_of_range_rejected() {
        let mut p = test_profile();
        p.window = HourWindow {
            start_hour: Some(6),
            end_hour: Some(24),
        };
        assert_validation_err(&p, "window.end_hour 24 out of range");
    }

    #[test]
    fn half_open_window_rejected() {
        let mut p = test_profile();
        p.window.start_hour = Some(6);
        assert_validation_err(&p, "window needs both");
    }

    #[test]
    fn zero_per_litres_rejected() {
        let mut p = test_profile();
        p.nutrients.b.per_litres = 0.0;
        assert_validation_err(&p, "nutrients.b.per_litres must be positive");
    }

    #[test]
    fn path_traversal_id_rejected() {
        let store = ProfileStore::new(std::env::temp_dir());
        let err = store.load("../etc/passwd").unwrap_err();
        assert!(format!("{err:#}").contains("invalid profile id"));
    }

    // -- Store --------------------------------------------------------------

    #[test]
    fn save_load_and_list() {
        let dir = scratch("store");
        let store = ProfileStore::new(&dir);
        store.save(&test_profile()).unwrap();

        assert_eq!(store.load("basil").unwrap(), test_profile());
        assert_eq!(store.list().unwrap(), vec!["basil".to_string()]);
    }

    #[test]
    fn id_defaults_to_file_name() {
        let dir = scratch("id");
        fs::write(dir.join("mint.json"), r#"{"pump": {"on_s": 5, "off_s": 5}}"#).unwrap();
        let p = ProfileStore::new(&dir).load("mint").unwrap();
        assert_eq!(p.id, "mint");
    }

    #[test]
    fn watcher_installs_valid_edit_and_ignores_broken_one() {
        let dir = scratch("watch");
        let store = ProfileStore::new(&dir);
        store.save(&test_profile()).unwrap();
        let mut watcher = ProfileWatcher::new(&store, test_profile());
        assert!(!watcher.poll());

        let mut edited = test_profile();
        edited.pump.on_s = 45.0;
        store.save(&edited).unwrap();
        watcher.modified = None;
        assert!(watcher.poll());
        assert_eq!(watcher.profile().pump.on_s, 45.0);

        fs::write(store.path_for("basil"), "{ broken").unwrap();
        watcher.modified = None;
        assert!(!watcher.poll());
        assert_eq!(watcher.profile().pump.on_s, 45.0);
    }
}
