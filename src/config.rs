use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::drivers::replay::{DEFAULT_REPLAY_INTERVAL, REPLAY_DEVICE_ID, SIMULATED_DEVICE_NAME};
use crate::drivers::shimmer::DEFAULT_BAUD_RATE;

pub const CONFIG_PATH_VAR: &str = "GSRSTICK_CONFIG";
pub const PORT_VAR: &str = "GSRSTICK_PORT";
pub const DATABASE_VAR: &str = "GSRSTICK_DB";
pub const LIVE_UPLOAD_VAR: &str = "GSRSTICK_LIVE_UPLOAD";
pub const FALLBACK_VAR: &str = "GSRSTICK_FALLBACK";
pub const CLOSE_STALE_VAR: &str = "GSRSTICK_CLOSE_STALE";

/// Packets received this soon after connect are dropped while the sensor settles.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(4);

/// Settings for one acquisition run.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub port: String,
    pub baud_rate: u32,
    pub database_path: PathBuf,
    pub allow_simulated_fallback: bool,
    /// Close a session-start left open by a crashed run before starting.
    /// Only safe when no other process streams from the same device.
    pub close_stale_sessions: bool,
    /// Persist each sample as it arrives instead of only on stop.
    pub live_upload: bool,
    pub warmup_ms: u64,
    pub replay_interval_ms: u64,
    pub replay_device_id: i64,
    pub simulated_device_name: String,
    pub subject_id: i64,
    pub label: String,
    /// How long the binary streams before stopping; 0 runs until the stream goes quiet.
    pub run_seconds: u64,
    pub poll_interval_ms: u64,
    /// Where samples that could not be flushed are exported as CSV.
    pub export_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let port = if cfg!(windows) { "COM5" } else { "/dev/rfcomm0" };
        Self {
            port: port.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            database_path: PathBuf::from("gsrstick.sqlite3"),
            allow_simulated_fallback: false,
            close_stale_sessions: false,
            live_upload: false,
            warmup_ms: DEFAULT_WARMUP.as_millis() as u64,
            replay_interval_ms: DEFAULT_REPLAY_INTERVAL.as_millis() as u64,
            replay_device_id: REPLAY_DEVICE_ID,
            simulated_device_name: SIMULATED_DEVICE_NAME.to_string(),
            subject_id: 0,
            label: String::new(),
            run_seconds: 60,
            poll_interval_ms: 1000,
            export_dir: PathBuf::from("."),
        }
    }
}

impl SessionConfig {
    /// Defaults, then the JSON file named by `GSRSTICK_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_VAR) {
            self.port = port;
        }
        if let Some(path) = lookup(DATABASE_VAR) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(LIVE_UPLOAD_VAR) {
            self.live_upload = parse_flag(LIVE_UPLOAD_VAR, &value)?;
        }
        if let Some(value) = lookup(FALLBACK_VAR) {
            self.allow_simulated_fallback = parse_flag(FALLBACK_VAR, &value)?;
        }
        if let Some(value) = lookup(CLOSE_STALE_VAR) {
            self.close_stale_sessions = parse_flag(CLOSE_STALE_VAR, &value)?;
        }
        Ok(())
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_duration(&self) -> Option<Duration> {
        (self.run_seconds > 0).then(|| Duration::from_secs(self.run_seconds))
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("{name}: expected a boolean, got '{other}'"),
    }
}
