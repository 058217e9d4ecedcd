// src/proto/parser.rs
use std::{fmt, str::FromStr};

use thiserror::Error;

use super::command::{
    Command, Identity, Measurement, Mode, OutputFormat, SweepDataPoint, SweepPhase, SweepStatus,
    Temperatures, VoltageRange, WifiStatus,
};
use crate::sweep::SweepReport;

/// Marker that opens every device refusal.
pub const ERROR_MARKER: &str = "ERROR";
/// Acknowledgement for setters and actions.
pub const ACK: &str = "OK";
/// Last line of a CSV sweep data block.
pub const BLOCK_END: &str = "END";

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty reply")]
    Empty,
    #[error("invalid number: {0}")]
    BadNumber(String),
    #[error("invalid boolean: {0}")]
    BadBool(String),
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("invalid enum for {0}: {1}")]
    BadEnum(&'static str, String),
    #[error("invalid json: {0}")]
    BadJson(String),
    #[error("invalid csv: {0}")]
    BadCsv(String),
}

/// First-level classification of a reply line.
#[derive(Debug, PartialEq)]
pub enum Reply<'a> {
    Ok,
    Error(String),
    Value(&'a str),
}

pub fn classify(line: &str) -> Reply<'_> {
    let s = line.trim();
    if s.eq_ignore_ascii_case(ACK) {
        return Reply::Ok;
    }
    if s.len() >= ERROR_MARKER.len()
        && s.is_char_boundary(ERROR_MARKER.len())
        && s[..ERROR_MARKER.len()].eq_ignore_ascii_case(ERROR_MARKER)
    {
        let msg = s[ERROR_MARKER.len()..]
            .trim_start_matches([':', ' '])
            .trim();
        let msg = if msg.is_empty() { "unspecified" } else { msg };
        return Reply::Error(msg.to_string());
    }
    Reply::Value(s)
}

/// Serialize a command to its wire line, without the terminator.
pub fn format_command(cmd: &Command) -> String {
    use Command::*;

    match cmd {
        // ---- System
        Identify => "*IDN?".into(),
        Temperatures => "SYST:TEMP?".into(),
        FourWire(on) => format!("SYST:4WIR {}", if *on { "ENA" } else { "DIS" }),
        FourWireQuery => "SYST:4WIR?".into(),
        WifiStatus => "SYST:WIFI?".into(),
        WifiAutoconnect(on) => format!("SYST:WIFI:AUTO {}", bool_to_str(*on)),
        WifiAutoconnectQuery => "SYST:WIFI:AUTO?".into(),
        SetTime { unix_ms } => format!("SYST:TIME {unix_ms}"),

        // ---- Source
        SetMode { ch, mode } => format!("SOUR{ch}:{}", mode_to_str(*mode)),
        ModeQuery(ch) => format!("SOUR{ch}:MODE?"),
        SetVoltage { ch, volts } => format!("SOUR{ch}:VOLT {}", format_fixed(*volts)),
        VoltageQuery(ch) => format!("SOUR{ch}:VOLT?"),
        SetCurrent { ch, amps } => format!("SOUR{ch}:CURR {}", format_engineering(*amps)),
        CurrentQuery(ch) => format!("SOUR{ch}:CURR?"),
        Output { ch, on } => format!("OUTP{ch} {}", if *on { "ON" } else { "OFF" }),
        OutputQuery(ch) => format!("OUTP{ch}?"),
        SetVoltageProtection { ch, volts } => {
            format!("SOUR{ch}:VOLT:PROT {}", format_fixed(*volts))
        }
        VoltageProtectionQuery(ch) => format!("SOUR{ch}:VOLT:PROT?"),
        SetCurrentProtection { ch, amps } => {
            format!("SOUR{ch}:CURR:PROT {}", format_engineering(*amps))
        }
        CurrentProtectionQuery(ch) => format!("SOUR{ch}:CURR:PROT?"),
        SetVoltageRange { ch, range } => {
            format!("SOUR{ch}:VOLT:RANG {}", voltage_range_to_str(*range))
        }
        SetCurrentRange { ch, range } => format!("SOUR{ch}:CURR:RANG {}", range.index()),
        CurrentRangeQuery(ch) => format!("SOUR{ch}:CURR:RANG?"),
        SetAutorange { ch, on } => format!("SOUR{ch}:CURR:RANG:AUTO {}", bool_to_str(*on)),
        AutorangeQuery(ch) => format!("SOUR{ch}:CURR:RANG:AUTO?"),

        // ---- Measure
        SetOversampling { ch, ratio } => format!("MEAS{ch}:OSR {ratio}"),
        MeasureVoltage(ch) => format!("MEAS{ch}:VOLT?"),
        MeasureCurrent(ch) => format!("MEAS{ch}:CURR?"),
        MeasureBoth(ch) => format!("MEAS{ch}:VOLT:CURR?"),

        // ---- Streaming
        SetSampleRate { ch, hz } => format!("SOUR{ch}:SRAT {hz}"),
        Stream { ch, on } => format!("SOUR{ch}:STRM {}", if *on { "ON" } else { "OFF" }),

        // ---- Sweep
        SweepStart { ch, volts } => format!("SWEEP{ch}:START {}", format_fixed(*volts)),
        SweepEnd { ch, volts } => format!("SWEEP{ch}:END {}", format_fixed(*volts)),
        SweepPoints { ch, points } => format!("SWEEP{ch}:POINTS {points}"),
        SweepDwell { ch, ms } => format!("SWEEP{ch}:DWELL {ms}"),
        SweepAutoOutput { ch, on } => format!("SWEEP{ch}:AUTO {}", bool_to_str(*on)),
        SweepAutoOutputQuery(ch) => format!("SWEEP{ch}:AUTO?"),
        SweepFormat { ch, format } => format!("SWEEP{ch}:FORMAT {}", format_to_str(*format)),
        SweepFormatQuery(ch) => format!("SWEEP{ch}:FORMAT?"),
        SweepExecute(ch) => format!("SWEEP{ch}:EXEC"),
        SweepStatus(ch) => format!("SWEEP{ch}:STAT?"),
        SweepAbort(ch) => format!("SWEEP{ch}:ABORT"),
        SweepData(ch) => format!("SWEEP{ch}:DATA?"),
    }
}

/* ---------- numbers ---------- */

/// Voltages go out as fixed decimal with 6 fractional digits.
pub fn format_fixed(value: f64) -> String {
    format!("{value:.6}")
}

/// Engineering notation: exponent a multiple of 3, mantissa in `[1, 1000)`.
pub fn format_engineering(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value:.6}E0");
    }
    let mut exp = (value.abs().log10().floor() as i32).div_euclid(3) * 3;
    let mut mantissa = value / 10f64.powi(exp);
    // log10 rounding can leave the mantissa one decade out
    if mantissa.abs() < 1.0 {
        exp -= 3;
        mantissa = value / 10f64.powi(exp);
    }
    if (mantissa.abs() * 1e6).round() >= 1e9 {
        exp += 3;
        mantissa = value / 10f64.powi(exp);
    }
    format!("{mantissa:.6}E{exp}")
}

/// Accepts plain/scientific notation or an SI prefix suffix, with an
/// optional trailing unit letter (`1.5e-3`, `1.5m`, `1.5mA`, `2.0V`).
pub fn parse_engineering(s: &str) -> Result<f64, ParseError> {
    let t = s.trim();
    if t.is_empty() {
        return Err(ParseError::Empty);
    }
    let body = t
        .strip_suffix(['A', 'V'])
        .filter(|b| !b.is_empty())
        .unwrap_or(t);
    let value = match body.parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            let (digits, scale) = split_si_prefix(body)
                .ok_or_else(|| ParseError::BadNumber(t.to_string()))?;
            digits
                .trim()
                .parse::<f64>()
                .map_err(|_| ParseError::BadNumber(t.to_string()))?
                * scale
        }
    };
    if !value.is_finite() {
        return Err(ParseError::BadNumber(t.to_string()));
    }
    Ok(value)
}

fn split_si_prefix(s: &str) -> Option<(&str, f64)> {
    const PREFIXES: [(&str, f64); 7] = [
        ("p", 1e-12),
        ("n", 1e-9),
        ("u", 1e-6),
        ("\u{b5}", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
    ];
    PREFIXES
        .iter()
        .find_map(|(p, scale)| s.strip_suffix(p).map(|d| (d, *scale)))
}

/* ---------- typed reply decoders ---------- */

pub fn parse_f64(s: &str) -> Result<f64, ParseError> {
    parse_engineering(s)
}

pub fn parse_bool(s: &str) -> Result<bool, ParseError> {
    match s.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" | "ENA" | "TRUE" => Ok(true),
        "0" | "OFF" | "DIS" | "FALSE" => Ok(false),
        _ => Err(ParseError::BadBool(s.trim().to_string())),
    }
}

pub fn parse_u8(s: &str) -> Result<u8, ParseError> {
    s.trim()
        .parse::<u8>()
        .map_err(|_| ParseError::BadNumber(s.trim().to_string()))
}

pub fn parse_measurement(s: &str) -> Result<Measurement, ParseError> {
    let [voltage, current] = fields::<2>(s)?;
    Ok(Measurement {
        voltage: parse_f64(voltage)?,
        current: parse_f64(current)?,
    })
}

pub fn parse_temperatures(s: &str) -> Result<Temperatures, ParseError> {
    let [adc, ch1, ch2] = fields::<3>(s)?;
    Ok(Temperatures {
        adc: parse_f64(adc)?,
        channel1: parse_f64(ch1)?,
        channel2: parse_f64(ch2)?,
    })
}

pub fn parse_identity(s: &str) -> Result<Identity, ParseError> {
    let [manufacturer, model, serial, firmware] = fields::<4>(s)?;
    Ok(Identity {
        manufacturer: manufacturer.to_string(),
        model: model.to_string(),
        serial: serial.to_string(),
        firmware: firmware.to_string(),
    })
}

pub fn parse_wifi_status(s: &str) -> Result<WifiStatus, ParseError> {
    let parts: Vec<&str> = s.trim().split(',').map(str::trim).collect();
    let connected = parse_bool(parts[0])?;
    if !connected {
        return Ok(WifiStatus {
            connected,
            ssid: None,
            ip_address: None,
            rssi: None,
        });
    }
    if parts.len() != 4 {
        return Err(ParseError::FieldCount {
            expected: 4,
            got: parts.len(),
        });
    }
    let rssi = parts[3]
        .parse::<i32>()
        .map_err(|_| ParseError::BadNumber(parts[3].to_string()))?;
    Ok(WifiStatus {
        connected,
        ssid: Some(parts[1].to_string()),
        ip_address: Some(parts[2].to_string()),
        rssi: Some(rssi),
    })
}

pub fn parse_mode(s: &str) -> Result<Mode, ParseError> {
    Mode::from_str(s.trim()).map_err(|_| ParseError::BadEnum("mode", s.trim().to_string()))
}

pub fn parse_output_format(s: &str) -> Result<OutputFormat, ParseError> {
    OutputFormat::from_str(s.trim())
        .map_err(|_| ParseError::BadEnum("format", s.trim().to_string()))
}

pub fn parse_sweep_status(s: &str) -> Result<SweepStatus, ParseError> {
    let [phase, current, total, elapsed, remaining] = fields::<5>(s)?;
    Ok(SweepStatus {
        phase: SweepPhase::from_str(phase)
            .map_err(|_| ParseError::BadEnum("phase", phase.to_string()))?,
        current_point: parse_int(current)?,
        total_points: parse_int(total)?,
        elapsed_ms: parse_int(elapsed)?,
        estimated_remaining_ms: parse_int(remaining)?,
    })
}

/// Rows of `timestamp,voltage,current` up to an optional `END` line; a
/// non-numeric first row is a header.
pub fn parse_sweep_csv(text: &str) -> Result<Vec<SweepDataPoint>, ParseError> {
    let block: Vec<&str> = text
        .lines()
        .map(str::trim)
        .take_while(|row| *row != BLOCK_END)
        .filter(|row| !row.is_empty())
        .collect();
    let has_header = block
        .first()
        .is_some_and(|row| row.starts_with(|c: char| c.is_ascii_alphabetic()));
    let body = block.join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut out = Vec::with_capacity(block.len());
    for record in reader.records() {
        let record = record.map_err(|e| ParseError::BadCsv(e.to_string()))?;
        if record.len() != 3 {
            return Err(ParseError::FieldCount {
                expected: 3,
                got: record.len(),
            });
        }
        out.push(SweepDataPoint {
            timestamp: parse_f64(&record[0])?,
            voltage: parse_f64(&record[1])?,
            current: parse_f64(&record[2])?,
        });
    }
    Ok(out)
}

pub fn parse_sweep_json(text: &str) -> Result<SweepReport, ParseError> {
    serde_json::from_str(text.trim()).map_err(|e| ParseError::BadJson(e.to_string()))
}

/* ---------- helpers ---------- */

fn fields<const N: usize>(s: &str) -> Result<[&str; N], ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    parts.try_into().map_err(|parts: Vec<&str>| ParseError::FieldCount {
        expected: N,
        got: parts.len(),
    })
}

fn parse_int<T: FromStr>(s: &str) -> Result<T, ParseError> {
    s.trim()
        .parse::<T>()
        .map_err(|_| ParseError::BadNumber(s.trim().to_string()))
}

/* ---------- enum string helpers & FromStr impls ---------- */

fn bool_to_str(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}
fn mode_to_str(m: Mode) -> &'static str {
    match m {
        Mode::ForceVoltageMeasureCurrent => "FVMI",
        Mode::ForceCurrentMeasureVoltage => "FIMV",
    }
}
fn voltage_range_to_str(r: VoltageRange) -> &'static str {
    match r {
        VoltageRange::Auto => "AUTO",
        VoltageRange::Low => "LOW",
        VoltageRange::High => "HIGH",
    }
}
fn format_to_str(f: OutputFormat) -> &'static str {
    match f {
        OutputFormat::Csv => "CSV",
        OutputFormat::Json => "JSON",
    }
}
fn phase_to_str(p: SweepPhase) -> &'static str {
    match p {
        SweepPhase::Idle => "IDLE",
        SweepPhase::Running => "RUNNING",
        SweepPhase::Completed => "COMPLETED",
        SweepPhase::Aborted => "ABORTED",
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(mode_to_str(*self))
    }
}
impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(format_to_str(*self))
    }
}
impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(phase_to_str(*self))
    }
}

impl FromStr for Mode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FVMI" => Ok(Mode::ForceVoltageMeasureCurrent),
            "FIMV" => Ok(Mode::ForceCurrentMeasureVoltage),
            _ => Err(()),
        }
    }
}
impl FromStr for VoltageRange {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(VoltageRange::Auto),
            "LOW" => Ok(VoltageRange::Low),
            "HIGH" => Ok(VoltageRange::High),
            _ => Err(()),
        }
    }
}
impl FromStr for OutputFormat {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CSV" => Ok(OutputFormat::Csv),
            "JSON" => Ok(OutputFormat::Json),
            _ => Err(()),
        }
    }
}
impl FromStr for SweepPhase {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(SweepPhase::Idle),
            "RUNNING" => Ok(SweepPhase::Running),
            "COMPLETED" | "COMPLETE" => Ok(SweepPhase::Completed),
            "ABORTED" => Ok(SweepPhase::Aborted),
            _ => Err(()),
        }
    }
}

/* ---------- tests ---------- */
