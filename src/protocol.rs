//! Wire protocol shared by the broadcast server and the sensor link.
//!
//! Records are JSON objects, one per line, tagged by a `type` field:
//!
//! ```text
//! {"type":"welcome","message":"Connected to PIR server","timestamp":"...","pir_state":0}
//! {"type":"pir_state","timestamp":"...","state":1,"motion":true,"pin":24,
//!  "motion_count":3,"time_since_change":0.0,"clients_connected":2}
//! ```

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Default TCP port of the broadcast server.
pub const DEFAULT_PORT: u16 = 5555;

/// Default period between two state broadcasts.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Greeting carried by every welcome record.
pub const WELCOME_MESSAGE: &str = "Connected to PIR server";

/// Binary PIR reading. Encoded on the wire as `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PirState {
    #[default]
    Idle,
    Motion,
}

impl PirState {
    pub fn is_motion(self) -> bool {
        self == PirState::Motion
    }
}

impl From<bool> for PirState {
    fn from(motion: bool) -> Self {
        if motion {
            PirState::Motion
        } else {
            PirState::Idle
        }
    }
}

impl From<PirState> for u8 {
    fn from(state: PirState) -> Self {
        match state {
            PirState::Idle => 0,
            PirState::Motion => 1,
        }
    }
}

impl TryFrom<u8> for PirState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PirState::Idle),
            1 => Ok(PirState::Motion),
            other => Err(format!("invalid PIR state {}, expected 0 or 1", other)),
        }
    }
}

impl fmt::Display for PirState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PirState::Idle => write!(f, "IDLE"),
            PirState::Motion => write!(f, "MOTION"),
        }
    }
}

/// Sent once to each client right after it is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeRecord {
    #[serde(default)]
    pub message: String,
    #[serde(default = "receipt_time", deserialize_with = "lenient_timestamp")]
    pub timestamp: NaiveDateTime,
    /// Sensor state at accept time, used to seed the client's edge detector.
    #[serde(default)]
    pub pir_state: PirState,
}

impl WelcomeRecord {
    pub fn new(pir_state: PirState) -> Self {
        Self {
            message: WELCOME_MESSAGE.to_string(),
            timestamp: Local::now().naive_local(),
            pir_state,
        }
    }
}

/// One broadcast tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default = "receipt_time", deserialize_with = "lenient_timestamp")]
    pub timestamp: NaiveDateTime,
    pub state: PirState,
    #[serde(default)]
    pub motion: bool,
    /// GPIO pin reported by the producer.
    #[serde(default)]
    pub pin: i64,
    /// Rising edges seen by the server since it started.
    #[serde(default)]
    pub motion_count: u64,
    /// Seconds since the last transition, 0 when there was none yet.
    #[serde(default)]
    pub time_since_change: f64,
    #[serde(default)]
    pub clients_connected: usize,
}

impl StateRecord {
    pub fn new(
        state: PirState,
        pin: u8,
        motion_count: u64,
        time_since_change: Duration,
        clients_connected: usize,
    ) -> Self {
        Self {
            timestamp: Local::now().naive_local(),
            state,
            motion: state.is_motion(),
            pin: i64::from(pin),
            motion_count,
            time_since_change: time_since_change.as_secs_f64(),
            clients_connected,
        }
    }
}

fn receipt_time() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Parse an ISO-8601 timestamp, with or without a UTC offset.
///
/// Offset forms (`Z`, `+02:00`) are converted to local time.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Local).naive_local());
    }
    text.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// A timestamp that is missing or does not parse becomes the time of receipt.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(parse_timestamp)
        .unwrap_or_else(receipt_time))
}

/// Any record that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    #[serde(rename = "welcome")]
    Welcome(WelcomeRecord),
    #[serde(rename = "pir_state")]
    State(StateRecord),
}

impl Record {
    /// Serialize as a single newline-terminated frame.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

impl From<WelcomeRecord> for Record {
    fn from(record: WelcomeRecord) -> Self {
        Record::Welcome(record)
    }
}

impl From<StateRecord> for Record {
    fn from(record: StateRecord) -> Self {
        Record::State(record)
    }
}
