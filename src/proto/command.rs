use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::range::CurrentRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Ch1,
    Ch2,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

    /// Wire index (1 or 2).
    pub fn index(self) -> u8 {
        match self {
            Channel::Ch1 => 1,
            Channel::Ch2 => 2,
        }
    }

    pub(crate) fn slot(self) -> usize {
        self.index() as usize - 1
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Channel::Ch1),
            2 => Ok(Channel::Ch2),
            _ => Err(Error::InvalidConfig(format!("channel must be 1 or 2, got {n}"))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ForceVoltageMeasureCurrent,
    ForceCurrentMeasureVoltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageRange {
    Auto,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "CSV", alias = "csv")]
    Csv,
    #[serde(rename = "JSON", alias = "json")]
    Json,
}

/// Sweep phase as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl SweepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SweepPhase::Completed | SweepPhase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepStatus {
    pub phase: SweepPhase,
    pub current_point: u32,
    pub total_points: u32,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
}

impl SweepStatus {
    /// Completed fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total_points == 0 {
            return 0.0;
        }
        (self.current_point as f64 / self.total_points as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepDataPoint {
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSample {
    pub channel: Channel,
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionLimits {
    pub voltage: f64,
    pub current: f64,
}

/// Temperatures in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperatures {
    pub adc: f64,
    pub channel1: f64,
    pub channel2: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// `ssid`, `ip_address` and `rssi` are only present while connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone)]
pub enum Command {
    // ---- System ----
    Identify,
    Temperatures,
    FourWire(bool),
    FourWireQuery,
    WifiStatus,
    WifiAutoconnect(bool),
    WifiAutoconnectQuery,
    SetTime { unix_ms: u64 },

    // ---- Source ----
    SetMode { ch: Channel, mode: Mode },
    ModeQuery(Channel),
    SetVoltage { ch: Channel, volts: f64 },
    VoltageQuery(Channel),
    SetCurrent { ch: Channel, amps: f64 },
    CurrentQuery(Channel),
    Output { ch: Channel, on: bool },
    OutputQuery(Channel),
    SetVoltageProtection { ch: Channel, volts: f64 },
    VoltageProtectionQuery(Channel),
    SetCurrentProtection { ch: Channel, amps: f64 },
    CurrentProtectionQuery(Channel),
    SetVoltageRange { ch: Channel, range: VoltageRange },
    SetCurrentRange { ch: Channel, range: CurrentRange },
    CurrentRangeQuery(Channel),
    SetAutorange { ch: Channel, on: bool },
    AutorangeQuery(Channel),

    // ---- Measure ----
    SetOversampling { ch: Channel, ratio: u8 },
    MeasureVoltage(Channel),
    MeasureCurrent(Channel),
    MeasureBoth(Channel),

    // ---- Streaming ----
    SetSampleRate { ch: Channel, hz: f64 },
    Stream { ch: Channel, on: bool },

    // ---- Sweep ----
    SweepStart { ch: Channel, volts: f64 },
    SweepEnd { ch: Channel, volts: f64 },
    SweepPoints { ch: Channel, points: u32 },
    SweepDwell { ch: Channel, ms: i64 },
    SweepAutoOutput { ch: Channel, on: bool },
    SweepAutoOutputQuery(Channel),
    SweepFormat { ch: Channel, format: OutputFormat },
    SweepFormatQuery(Channel),
    SweepExecute(Channel),
    SweepStatus(Channel),
    SweepAbort(Channel),
    SweepData(Channel),
}
