//! Pause snapshots and crash-recovery checkpoints.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::warn;

use crate::config::write_json_atomic;
use crate::state::RuntimeStatus;

// ---------------------------------------------------------------------------
// Pause snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResumePhase {
    pub on: bool,
    pub remaining_s: f64,
}

/// What the scheduler was doing at the pause edge. Lives in the status
/// record until the resume edge consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResumeSnapshot {
    pub pump: ResumePhase,
    pub agitator: ResumePhase,
    pub air_pump: ResumePhase,
    /// Seconds until the next pump start that was pending at pause.
    pub due_in_s: Option<f64>,
    /// Paused outside the irrigation window.
    pub window_closed: bool,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Coarse run state persisted periodically so a restart can tell whether
/// irrigation was mid-cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub profile_id: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default)]
    pub pump_on: bool,
    #[serde(default)]
    pub fan_on: bool,
    #[serde(default)]
    pub heater_on: bool,
    #[serde(default)]
    pub humidifier_on: bool,
    #[serde(default)]
    pub agitator_on: bool,
    #[serde(default)]
    pub air_pump_on: bool,
    #[serde(default)]
    pub last_temperature_c: Option<f64>,
    #[serde(default)]
    pub last_humidity_pct: Option<f64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
}

impl Checkpoint {
    /// `None` when no run is active.
    pub fn from_status(st: &RuntimeStatus) -> Option<Self> {
        let profile_id = st.profile_id.clone()?;
        let a = &st.actuators;
        Some(Self {
            profile_id,
            started_at: st.started_at,
            cycle_count: st.cycle_count,
            pump_on: a.pump,
            fan_on: a.fan,
            heater_on: a.heater,
            humidifier_on: a.humidifier,
            agitator_on: a.agitator,
            air_pump_on: a.air_pump,
            last_temperature_c: st.readings.temperature_c,
            last_humidity_pct: st.readings.humidity_pct,
            paused: st.paused,
            saved_at: OffsetDateTime::now_utc(),
        })
    }

    /// Irrigation was running when the checkpoint was written.
    pub fn was_mid_cycle(&self) -> bool {
        !self.paused && (self.pump_on || self.agitator_on || self.air_pump_on)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json_atomic(&self.path, checkpoint)
            .with_context(|| format!("saving checkpoint {}", self.path.display()))
    }

    /// Missing or unreadable checkpoints both read as "nothing to resume".
    pub fn load(&self) -> Option<Checkpoint> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "checkpoint unreadable: {e}");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(path = %self.path.display(), "checkpoint corrupt, ignoring: {e}");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> CheckpointStore {
        let dir = std::env::temp_dir().join(format!(
            "growctl-recovery-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        CheckpointStore::new(dir.join("checkpoint.json"))
    }

    #[test]
    fn from_status_requires_active_run() {
        let st = RuntimeStatus::new();
        assert!(Checkpoint::from_status(&st).is_none());
    }

    #[test]
    fn save_load_clear() {
        let store = store("roundtrip");
        let mut st = RuntimeStatus::new();
        st.profile_id = Some("basil".into());
        st.cycle_count = 7;
        st.actuators.pump = true;
        st.readings.temperature_c = Some(21.5);

        let cp = Checkpoint::from_status(&st).unwrap();
        store.save(&cp).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.profile_id, "basil");
        assert_eq!(loaded.cycle_count, 7);
        assert!(loaded.was_mid_cycle());
        assert_eq!(loaded.last_temperature_c, Some(21.5));

        store.clear().unwrap();
        assert!(store.load().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_checkpoint_reads_as_none() {
        let store = store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn paused_run_is_not_mid_cycle() {
        let mut st = RuntimeStatus::new();
        st.profile_id = Some("basil".into());
        st.actuators.pump = true;
        st.paused = true;
        assert!(!Checkpoint::from_status(&st).unwrap().was_mid_cycle());
    }
}
