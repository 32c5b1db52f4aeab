// src/types.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Which kind of driver sits behind a session
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum ConnectionMode {
    Simulation,
    Hardware,
}

/// Lifecycle of a connected session. There is no session object before a
/// successful connect, so no "disconnected" state is stored.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize)]
pub enum SessionState {
    /// Driver open and callback registered, not yet streaming.
    Connecting,
    Streaming,
    Stopped,
}

/// One packet as delivered by a driver, before calibration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawPacket {
    pub device_time: u32,
    pub raw_gsr: u16,
    pub raw_ppg: i32,
}

/// A calibrated sample held in the live buffer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub capture_time: DateTime<Utc>,
    pub device_time: u32,
    pub raw_gsr: u16,
    pub raw_ppg: i32,
    /// Skin conductance in µS; `None` when the reading is outside the calibrated domain.
    pub conductance: Option<f64>,
}

/// A sample row read back from storage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredSample {
    pub id: i64,
    pub device_id: i64,
    pub capture_time: DateTime<Utc>,
    pub device_time: u32,
    pub raw_gsr: u16,
    pub raw_ppg: i32,
}

impl StoredSample {
    pub fn to_packet(&self) -> RawPacket {
        RawPacket {
            device_time: self.device_time,
            raw_gsr: self.raw_gsr,
            raw_ppg: self.raw_ppg,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: i64,
    pub name: String,
    pub port: String,
    pub battery_percent: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    SessionStart,
    SessionStop,
    ReplayStart,
    ReplayEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::SessionStop => "session_stop",
            EventKind::ReplayStart => "replay_start",
            EventKind::ReplayEnd => "replay_end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "session_start" => Ok(EventKind::SessionStart),
            "session_stop" => Ok(EventKind::SessionStop),
            "replay_start" => Ok(EventKind::ReplayStart),
            "replay_end" => Ok(EventKind::ReplayEnd),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// Session boundary marker. Replay markers carry no subject.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionEvent {
    pub device_id: i64,
    pub subject_id: Option<i64>,
    pub kind: EventKind,
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(
        device_id: i64,
        subject_id: Option<i64>,
        kind: EventKind,
        label: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            subject_id,
            kind,
            label: label.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The most recent session-start of a device that has no matching stop yet.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenSession {
    pub subject_id: Option<i64>,
    pub label: String,
    pub started_at: DateTime<Utc>,
}
