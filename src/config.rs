//! Configuration persistence for the trainer.
//!
//! Saves and loads trainer configuration to/from YAML files. Every field has
//! a default, so a missing file or a partial one still loads.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TrainerError};
use crate::hints::HintSettings;
use crate::keys::KeyRange;
use crate::midi::DEFAULT_TEMPO;
use crate::timeline::TimelineSettings;

/// Time past a deadline after which an unplayed target completes by itself
pub const DEFAULT_GRACE_PERIOD_MS: u32 = 2500;

/// Practice timing and hint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Beats of silence before the first note
    pub lead_in_beats: f64,
    /// Tempo (µs per beat) until the first tempo event
    pub default_tempo: u32,
    pub key_time_offset_ms: i64,
    pub blink_start_offset_ms: i64,
    pub blink_interval_ms: i64,
    pub blink_slow_interval_ms: i64,
    pub blink_fast_start_offset_ms: i64,
    pub late_hint_outdate_ms: i64,
    /// Complete a target by time this long after its deadline.
    /// `null` waits for the keys forever.
    pub grace_period_ms: Option<u32>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let hints = HintSettings::default();
        Self {
            lead_in_beats: 4.0,
            default_tempo: DEFAULT_TEMPO,
            key_time_offset_ms: hints.key_time_offset_ms,
            blink_start_offset_ms: hints.blink_start_offset_ms,
            blink_interval_ms: hints.blink_interval_ms,
            blink_slow_interval_ms: hints.blink_slow_interval_ms,
            blink_fast_start_offset_ms: hints.blink_fast_start_offset_ms,
            late_hint_outdate_ms: hints.late_hint_outdate_ms,
            grace_period_ms: Some(DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

/// Device loop periods and reconnect behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub light_tick_ms: u64,
    pub heartbeat_ms: u64,
    /// Rescan period while waiting for the device
    pub port_retry_ms: u64,
    /// Reconnect after the device went away
    pub autoreconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            light_tick_ms: 25,
            heartbeat_ms: 50,
            port_retry_ms: 1000,
            autoreconnect: true,
        }
    }
}

impl DeviceConfig {
    pub fn light_tick(&self) -> Duration {
        Duration::from_millis(self.light_tick_ms.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn port_retry(&self) -> Duration {
        Duration::from_millis(self.port_retry_ms)
    }
}

/// Complete trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// MIDI port name of the keyboard, matched exactly for input and output
    pub device_name: String,
    /// MIDI file opened when none is given on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub music_path: Option<PathBuf>,
    pub keyboard: KeyRange,
    pub player: PlayerConfig,
    pub device: DeviceConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            device_name: "CASIO USB-MIDI".to_string(),
            music_path: None,
            keyboard: KeyRange::default(),
            player: PlayerConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        let project_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        project_dir.join("keyhint_config.yaml")
    }

    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| TrainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Save configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).map_err(|source| TrainerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn timeline_settings(&self) -> TimelineSettings {
        TimelineSettings {
            lead_in_beats: self.player.lead_in_beats,
            default_tempo: self.player.default_tempo,
        }
    }

    pub fn hint_settings(&self) -> HintSettings {
        HintSettings {
            key_time_offset_ms: self.player.key_time_offset_ms,
            blink_start_offset_ms: self.player.blink_start_offset_ms,
            blink_interval_ms: self.player.blink_interval_ms,
            blink_slow_interval_ms: self.player.blink_slow_interval_ms,
            blink_fast_start_offset_ms: self.player.blink_fast_start_offset_ms,
            late_hint_outdate_ms: self.player.late_hint_outdate_ms,
        }
    }
}
