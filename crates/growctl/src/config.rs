//! Service configuration: a TOML file describing file locations, the relay
//! wiring, the scale calibration and the outbound channels. Environment
//! variables override the file for deployment-specific values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::UtcOffset;

use crate::hardware::Device;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub web: WebConfig,
    pub mqtt: MqttConfig,
    pub relays: RelayConfig,
    pub scale: ScaleConfig,
    /// Resume a checkpointed run automatically at startup.
    pub auto_resume: bool,
    /// Fixed offset for the irrigation window, e.g. `"+01:00"`. Without it
    /// the host offset is read once at startup, so a DST change only moves
    /// the window after a restart.
    pub utc_offset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub settings: PathBuf,
    pub profiles_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub calibration: PathBuf,
    pub events_db: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub fan: i64,
    pub heater: i64,
    pub humidifier: i64,
    pub main_pump: i64,
    pub agitator: i64,
    pub air_pump: i64,
    pub nutrient_a: i64,
    pub nutrient_b: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Raw load-cell counts with an empty reservoir on the scale.
    pub baseline_counts: f64,
    pub counts_per_kg: f64,
    /// Raw samples averaged per reading.
    pub samples: usize,
    pub period_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            web: WebConfig::default(),
            mqtt: MqttConfig::default(),
            relays: RelayConfig::default(),
            scale: ScaleConfig::default(),
            auto_resume: false,
            utc_offset: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            settings: PathBuf::from("config/global_settings.json"),
            profiles_dir: PathBuf::from("profiles"),
            checkpoint: PathBuf::from("data/checkpoint.json"),
            calibration: PathBuf::from("config/nutrient_cal.json"),
            events_db: "sqlite:data/events.db?mode=rwc".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "growctl".to_string(),
            topic: "growctl/notify".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            active_low: true,
            fan: 22,
            heater: 24,
            humidifier: 18,
            main_pump: 27,
            agitator: 5,
            air_pump: 25,
            nutrient_a: 6,
            nutrient_b: 26,
        }
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            baseline_counts: 8_388_000.0,
            counts_per_kg: 21_500.0,
            samples: 6,
            period_ms: 500,
        }
    }
}

impl RelayConfig {
    /// Device to BCM pin pairs in a fixed order.
    pub fn pins(&self) -> Vec<(Device, i64)> {
        vec![
            (Device::Fan, self.fan),
            (Device::Heater, self.heater),
            (Device::Humidifier, self.humidifier),
            (Device::MainPump, self.main_pump),
            (Device::Agitator, self.agitator),
            (Device::AirPump, self.air_pump),
            (Device::NutrientA, self.nutrient_a),
            (Device::NutrientB, self.nutrient_b),
        ]
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Fastest scale poll the HX711 front-end can sustain.
const MIN_SCALE_PERIOD_MS: u64 = 50;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_relays(&mut errors);
        self.validate_scale(&mut errors);
        self.validate_channels(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (device, pin) in self.relays.pins() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "relays.{device}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "relays.{device}: gpio {pin} is already used by another device"
                ));
            }
        }
    }

    fn validate_scale(&self, errors: &mut Vec<String>) {
        let s = &self.scale;
        if !s.counts_per_kg.is_finite() || s.counts_per_kg == 0.0 {
            errors.push(format!(
                "scale.counts_per_kg must be a non-zero number, got {}",
                s.counts_per_kg
            ));
        }
        if !s.baseline_counts.is_finite() {
            errors.push("scale.baseline_counts must be finite".to_string());
        }
        if s.samples == 0 {
            errors.push("scale.samples must be at least 1".to_string());
        }
        if s.period_ms < MIN_SCALE_PERIOD_MS {
            errors.push(format!(
                "scale.period_ms must be at least {MIN_SCALE_PERIOD_MS}, got {}",
                s.period_ms
            ));
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if self.paths.events_db.trim().is_empty() {
            errors.push("paths.events_db is empty".to_string());
        }
        if let Some(offset) = &self.utc_offset {
            if let Err(e) = parse_utc_offset(offset) {
                errors.push(format!("{e:#}"));
            }
        }

        // ── MQTT (only checked when enabled) ─────────────────────
        if self.mqtt.enabled {
            if self.mqtt.host.trim().is_empty() {
                errors.push("mqtt.host is empty".to_string());
            }
            if self.mqtt.port == 0 {
                errors.push("mqtt.port must be non-zero".to_string());
            }
            if self.mqtt.topic.trim().is_empty() {
                errors.push("mqtt.topic is empty".to_string());
            }
            if self.mqtt.client_id.trim().is_empty() {
                errors.push("mqtt.client_id is empty".to_string());
            }
        }
    }

    /// Offset used for window gating: the configured one, else the host's.
    /// The host offset can only be read while the process is single-threaded.
    pub fn local_offset(&self) -> Result<UtcOffset> {
        match &self.utc_offset {
            Some(offset) => parse_utc_offset(offset),
            None => Ok(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)),
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL`, `WEB_PORT`, `UTC_OFFSET` and
    /// `RELAY_ACTIVE_LOW` on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
            self.mqtt.enabled = true;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(url) = env::var("DB_URL") {
            self.paths.events_db = url;
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
        if let Ok(offset) = env::var("UTC_OFFSET") {
            self.utc_offset = Some(offset);
        }
        if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
            self.relays.active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

/// `+HH:MM` or `-HH:MM`.
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(
        s.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("utc_offset '{s}' must look like +01:00"))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Serialise `value` as pretty JSON and replace `path` atomically: the bytes
/// land in a sibling temp file which is fsynced and renamed over the target.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialise json")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.web.port, 8080);
        assert!(config.relays.active_low);
        assert_eq!(config.scale.samples, 6);
        assert!(!config.auto_resume);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
auto_resume = true

[relays]
active_low = false
main_pump = 17

[scale]
counts_per_kg = 1000.0

[mqtt]
enabled = true
host = "broker.local"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.auto_resume);
        assert!(!config.relays.active_low);
        assert_eq!(config.relays.main_pump, 17);
        assert_eq!(config.relays.fan, 22);
        assert_eq!(config.scale.counts_per_kg, 1000.0);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        config.validate().unwrap();
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn default_config_passes() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn relay_pin_outside_header_rejected() {
        let mut cfg = Config::default();
        cfg.relays.heater = 1;
        assert_validation_err(&cfg, "relays.heater: gpio 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn relay_duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.relays.nutrient_b = cfg.relays.nutrient_a;
        assert_validation_err(&cfg, "already used by another device");
    }

    #[test]
    fn scale_zero_counts_per_kg_rejected() {
        let mut cfg = Config::default();
        cfg.scale.counts_per_kg = 0.0;
        assert_validation_err(&cfg, "scale.counts_per_kg");
    }

    #[test]
    fn scale_period_too_short_rejected() {
        let mut cfg = Config::default();
        cfg.scale.period_ms = 10;
        assert_validation_err(&cfg, "scale.period_ms must be at least 50");
    }

    #[test]
    fn mqtt_checked_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.mqtt.host = String::new();
        cfg.validate().unwrap();

        cfg.mqtt.enabled = true;
        assert_validation_err(&cfg, "mqtt.host is empty");
    }

    #[test]
    fn utc_offset_parsed_or_rejected() {
        let mut cfg = Config::default();
        cfg.utc_offset = Some("+02:00".into());
        cfg.validate().unwrap();
        assert_eq!(cfg.local_offset().unwrap(), UtcOffset::from_hms(2, 0, 0).unwrap());

        cfg.utc_offset = Some("-05:30".into());
        assert_eq!(cfg.local_offset().unwrap(), UtcOffset::from_hms(-5, -30, 0).unwrap());

        cfg.utc_offset = Some("CET".into());
        assert_validation_err(&cfg, "utc_offset 'CET' must look like +01:00");
    }

    #[test]
    fn multiple_errors_all_reported() {
        let mut cfg = Config::default();
        cfg.scale.samples = 0;
        cfg.web.port = 0;
        cfg.relays.fan = 99;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    // -- Atomic write -----------------------------------------------------

    #[test]
    fn write_json_atomic_replaces_file() {
        let dir = std::env::temp_dir().join(format!("growctl-config-{}", std::process::id()));
        let path = dir.join("nested").join("value.json");
        let _ = fs::remove_dir_all(&dir);

        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();

        let back: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["a"], 2);
        assert!(!path.with_extension("json.tmp").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
