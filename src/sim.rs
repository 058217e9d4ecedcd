//! In-memory instrument for tests: answers the wire protocol from a small
//! device model (1 kΩ load on both channels).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::build_packet;
use crate::port::Transport;
use crate::proto::command::{Channel, Mode, OutputFormat, StreamSample, SweepPhase};
use crate::proto::parser::{parse_bool, parse_f64};

const LOAD_OHMS: f64 = 1000.0;
const MAX_VOLTS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct SimSweep {
    pub start: f64,
    pub end: f64,
    pub points: u32,
    pub dwell_ms: i64,
    pub auto_output: bool,
    pub format: OutputFormat,
    pub phase: SweepPhase,
    pub progress: u32,
}

impl Default for SimSweep {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 0.0,
            points: 0,
            dwell_ms: 0,
            auto_output: true,
            format: OutputFormat::Csv,
            phase: SweepPhase::Idle,
            progress: 0,
        }
    }
}

impl SimSweep {
    fn voltage_at(&self, i: u32) -> f64 {
        self.start + i as f64 * (self.end - self.start) / (self.points.max(2) - 1) as f64
    }
}

#[derive(Debug, Clone)]
pub struct SimChannel {
    pub mode: Mode,
    pub voltage: f64,
    pub current: f64,
    pub enabled: bool,
    pub voltage_protection: f64,
    pub current_protection: f64,
    pub range: u8,
    pub autorange: bool,
    pub sample_rate: f64,
    pub streaming: bool,
    pub stream_clock: f64,
    pub sweep: SimSweep,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            mode: Mode::ForceVoltageMeasureCurrent,
            voltage: 0.0,
            current: 0.0,
            enabled: false,
            voltage_protection: MAX_VOLTS,
            current_protection: 0.18,
            range: 4,
            autorange: true,
            sample_rate: 100.0,
            streaming: false,
            stream_clock: 0.0,
            sweep: SimSweep::default(),
        }
    }
}

impl SimChannel {
    /// (voltage, current) across the load.
    fn measure(&self) -> (f64, f64) {
        if !self.enabled {
            return (0.0, 0.0);
        }
        match self.mode {
            Mode::ForceVoltageMeasureCurrent => (self.voltage, self.voltage / LOAD_OHMS),
            Mode::ForceCurrentMeasureVoltage => (self.current * LOAD_OHMS, self.current),
        }
    }
}

#[derive(Debug)]
pub struct SimState {
    pub sent: Vec<String>,
    pub outbox: VecDeque<String>,
    pub closed: bool,
    /// Swallow commands without replying.
    pub mute: bool,
    /// Stop emitting stream packets.
    pub paused: bool,
    /// Replaces the next reply verbatim.
    pub override_reply: Option<String>,
    /// Packets of each streaming channel emitted ahead of any reply.
    pub in_flight: usize,
    /// Sweep points completed per status poll.
    pub points_per_poll: u32,
    pub channels: [SimChannel; 2],
    pub fourwire: bool,
    pub wifi: Option<(String, String, i32)>,
    pub wifi_autoconnect: bool,
    pub clock_ms: u64,
    next_stream: usize,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            outbox: VecDeque::new(),
            closed: false,
            mute: false,
            paused: false,
            override_reply: None,
            in_flight: 2,
            points_per_poll: 5,
            channels: Default::default(),
            fourwire: false,
            wifi: None,
            wifi_autoconnect: false,
            clock_ms: 0,
            next_stream: 0,
        }
    }
}

impl SimState {
    fn busy(&self) -> bool {
        self.channels
            .iter()
            .any(|c| c.streaming || c.sweep.phase == SweepPhase::Running)
    }

    fn packet(&mut self, slot: usize) -> String {
        let c = &mut self.channels[slot];
        let (voltage, current) = c.measure();
        let sample = StreamSample {
            channel: Channel::ALL[slot],
            timestamp: c.stream_clock,
            voltage,
            current,
        };
        c.stream_clock += 1.0 / c.sample_rate;
        build_packet(&sample)
    }

    /// Round-robin over streaming channels.
    fn next_packet(&mut self) -> Option<String> {
        for _ in 0..2 {
            let slot = self.next_stream;
            self.next_stream = (self.next_stream + 1) % 2;
            if self.channels[slot].streaming {
                return Some(self.packet(slot));
            }
        }
        None
    }

    fn handle(&mut self, line: &str) {
        for slot in 0..2 {
            if self.channels[slot].streaming {
                for _ in 0..self.in_flight {
                    let p = self.packet(slot);
                    self.outbox.push_back(p);
                }
            }
        }
        match self.reply(line.trim()) {
            Reply::Line(r) => self.outbox.push_back(r),
            Reply::Block(rows) => self.outbox.extend(rows),
        }
    }

    fn reply(&mut self, line: &str) -> Reply {
        let (head, arg) = match line.split_once(' ') {
            Some((h, a)) => (h, Some(a.trim())),
            None => (line, None),
        };
        match (head, arg) {
            ("*IDN?", None) => ok_value("Undalogic,miniSMU MS01,SIM0001,1.3.0"),
            ("SYST:TEMP?", None) => ok_value("31.50,30.25,30.75"),
            ("SYST:4WIR?", None) => ok_value(bool_str(self.fourwire)),
            ("SYST:4WIR", Some(a)) => {
                if self.busy() {
                    return error("mode conflict: channel busy");
                }
                match a {
                    "ENA" => self.fourwire = true,
                    "DIS" => self.fourwire = false,
                    _ => return error("bad argument"),
                }
                ack()
            }
            ("SYST:WIFI?", None) => match &self.wifi {
                Some((ssid, ip, rssi)) => Reply::Line(format!("1,{ssid},{ip},{rssi}")),
                None => ok_value("0"),
            },
            ("SYST:WIFI:AUTO?", None) => ok_value(bool_str(self.wifi_autoconnect)),
            ("SYST:WIFI:AUTO", Some(a)) => match parse_bool(a) {
                Ok(on) => {
                    self.wifi_autoconnect = on;
                    ack()
                }
                Err(_) => error("bad argument"),
            },
            ("SYST:TIME", Some(a)) => match a.parse() {
                Ok(ms) => {
                    self.clock_ms = ms;
                    ack()
                }
                Err(_) => error("bad timestamp"),
            },
            _ => self.channel_reply(head, arg),
        }
    }

    fn channel_reply(&mut self, head: &str, arg: Option<&str>) -> Reply {
        let Some(pos) = head.find(|c: char| c.is_ascii_digit()) else {
            return error("unknown command");
        };
        let (root, rest) = head.split_at(pos);
        let slot = match &rest[..1] {
            "1" => 0,
            "2" => 1,
            _ => return error("invalid channel"),
        };
        let sub = &rest[1..];
        match root {
            "SOUR" => self.source(slot, sub, arg),
            "OUTP" => {
                let c = &mut self.channels[slot];
                match (sub, arg) {
                    ("?", None) => ok_value(bool_str(c.enabled)),
                    ("", Some("ON")) => {
                        c.enabled = true;
                        ack()
                    }
                    ("", Some("OFF")) => {
                        c.enabled = false;
                        ack()
                    }
                    _ => error("unknown command"),
                }
            }
            "MEAS" => {
                let (v, i) = self.channels[slot].measure();
                match (sub, arg) {
                    (":VOLT?", None) => Reply::Line(format!("{v:.6}")),
                    (":CURR?", None) => Reply::Line(format!("{i:e}")),
                    (":VOLT:CURR?", None) => Reply::Line(format!("{v:.6},{i:e}")),
                    (":OSR", Some(r)) => match r.parse::<u8>() {
                        Ok(r) if r <= 15 => ack(),
                        _ => error("oversampling ratio out of range"),
                    },
                    _ => error("unknown command"),
                }
            }
            "SWEEP" => self.sweep(slot, sub, arg),
            _ => error("unknown command"),
        }
    }

    fn source(&mut self, slot: usize, sub: &str, arg: Option<&str>) -> Reply {
        let c = &mut self.channels[slot];
        let num = arg.map(parse_f64);
        match (sub, num) {
            (":FVMI", None) => {
                c.mode = Mode::ForceVoltageMeasureCurrent;
                ack()
            }
            (":FIMV", None) => {
                c.mode = Mode::ForceCurrentMeasureVoltage;
                ack()
            }
            (":MODE?", None) => ok_value(match c.mode {
                Mode::ForceVoltageMeasureCurrent => "FVMI",
                Mode::ForceCurrentMeasureVoltage => "FIMV",
            }),
            (":VOLT", Some(Ok(v))) => {
                if v.abs() > MAX_VOLTS {
                    return error("voltage out of range");
                }
                c.voltage = v;
                ack()
            }
            (":VOLT?", None) => Reply::Line(format!("{:.6}", c.voltage)),
            (":CURR", Some(Ok(i))) => {
                c.current = i;
                ack()
            }
            (":CURR?", None) => Reply::Line(format!("{:e}", c.current)),
            (":VOLT:PROT", Some(Ok(v))) => {
                c.voltage_protection = v;
                ack()
            }
            (":VOLT:PROT?", None) => Reply::Line(format!("{:.6}", c.voltage_protection)),
            (":CURR:PROT", Some(Ok(i))) => {
                c.current_protection = i;
                ack()
            }
            (":CURR:PROT?", None) => Reply::Line(format!("{:e}", c.current_protection)),
            (":VOLT:RANG", _) => match arg {
                Some("AUTO" | "LOW" | "HIGH") => ack(),
                _ => error("bad voltage range"),
            },
            (":CURR:RANG", Some(Ok(r))) if (0.0..=4.0).contains(&r) => {
                c.range = r as u8;
                ack()
            }
            (":CURR:RANG?", None) => Reply::Line(c.range.to_string()),
            (":CURR:RANG:AUTO", Some(Ok(on))) => {
                c.autorange = on != 0.0;
                ack()
            }
            (":CURR:RANG:AUTO?", None) => ok_value(bool_str(c.autorange)),
            (":SRAT", Some(Ok(hz))) if hz > 0.0 => {
                c.sample_rate = hz;
                ack()
            }
            (":STRM", _) => match arg {
                Some("ON") => {
                    c.streaming = true;
                    ack()
                }
                Some("OFF") => {
                    c.streaming = false;
                    ack()
                }
                _ => error("bad argument"),
            },
            _ => error("unknown command"),
        }
    }

    fn sweep(&mut self, slot: usize, sub: &str, arg: Option<&str>) -> Reply {
        let ppp = self.points_per_poll;
        let s = &mut self.channels[slot].sweep;
        match (sub, arg) {
            (":START", Some(a)) => set(parse_f64(a).ok(), &mut s.start),
            (":END", Some(a)) => set(parse_f64(a).ok(), &mut s.end),
            (":POINTS", Some(a)) => set(a.parse().ok(), &mut s.points),
            (":DWELL", Some(a)) => set(a.parse().ok(), &mut s.dwell_ms),
            (":AUTO", Some(a)) => set(parse_bool(a).ok(), &mut s.auto_output),
            (":AUTO?", None) => ok_value(bool_str(s.auto_output)),
            (":FORMAT", Some("CSV")) => set(Some(OutputFormat::Csv), &mut s.format),
            (":FORMAT", Some("JSON")) => set(Some(OutputFormat::Json), &mut s.format),
            (":FORMAT?", None) => ok_value(match s.format {
                OutputFormat::Csv => "CSV",
                OutputFormat::Json => "JSON",
            }),
            (":EXEC", None) => {
                if s.points < 2 {
                    return error("sweep not configured");
                }
                s.phase = SweepPhase::Running;
                s.progress = 0;
                ack()
            }
            (":STAT?", None) => {
                if s.phase == SweepPhase::Running {
                    s.progress = (s.progress + ppp).min(s.points);
                    if s.progress == s.points {
                        s.phase = SweepPhase::Completed;
                    }
                }
                let dwell = s.dwell_ms.max(0) as u64;
                Reply::Line(format!(
                    "{},{},{},{},{}",
                    s.phase,
                    s.progress,
                    s.points,
                    s.progress as u64 * dwell,
                    (s.points - s.progress) as u64 * dwell
                ))
            }
            (":ABORT", None) => {
                if s.phase == SweepPhase::Running {
                    s.phase = SweepPhase::Aborted;
                }
                ack()
            }
            (":DATA?", None) => sweep_data(s),
            _ => error("unknown command"),
        }
    }
}

enum Reply {
    Line(String),
    Block(Vec<String>),
}

fn ack() -> Reply {
    Reply::Line("OK".into())
}

fn ok_value(v: &str) -> Reply {
    Reply::Line(v.to_string())
}

fn error(msg: &str) -> Reply {
    Reply::Line(format!("ERROR: {msg}"))
}

fn bool_str(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}

fn set<T>(value: Option<T>, slot: &mut T) -> Reply {
    match value {
        Some(v) => {
            *slot = v;
            ack()
        }
        None => error("bad argument"),
    }
}

fn sweep_data(s: &SimSweep) -> Reply {
    let collected = match s.phase {
        SweepPhase::Completed => s.points,
        SweepPhase::Aborted if s.progress > 0 => s.progress,
        _ => return error("no sweep data available"),
    };
    let points: Vec<(f64, f64, f64)> = (0..collected)
        .map(|i| {
            let v = s.voltage_at(i);
            (i as f64 * s.dwell_ms as f64 / 1000.0, v, v / LOAD_OHMS)
        })
        .collect();
    match s.format {
        OutputFormat::Csv => {
            let mut rows = vec!["timestamp,voltage,current".to_string()];
            rows.extend(points.iter().map(|(t, v, i)| format!("{t:.3},{v:.6},{i:e}")));
            rows.push("END".into());
            Reply::Block(rows)
        }
        OutputFormat::Json => {
            let data: Vec<_> = points
                .iter()
                .map(|(t, v, i)| serde_json::json!({"timestamp": t, "voltage": v, "current": i}))
                .collect();
            let doc = serde_json::json!({
                "config": {
                    "start_voltage": s.start,
                    "end_voltage": s.end,
                    "points": s.points,
                    "dwell_ms": s.dwell_ms,
                },
                "data": data,
            });
            Reply::Line(doc.to_string())
        }
    }
}

/// Shared handle: tests keep one clone to inspect and steer the device
/// while the session owns the other.
#[derive(Clone, Default)]
pub struct SimSmu {
    state: Arc<Mutex<SimState>>,
}

impl SimSmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut s = self.state.lock().unwrap();
        f(&mut s)
    }

    pub fn sent(&self) -> Vec<String> {
        self.with_state(|s| s.sent.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }
}

impl Transport for SimSmu {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.with_state(|s| {
            if s.closed {
                return Err(Error::Closed);
            }
            s.sent.push(line.to_string());
            if s.mute {
                return Ok(());
            }
            match s.override_reply.take() {
                Some(r) => s.outbox.push_back(r),
                None => s.handle(line),
            }
            Ok(())
        })
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<String> {
        self.with_state(|s| {
            if s.closed {
                return Err(Error::Closed);
            }
            if let Some(line) = s.outbox.pop_front() {
                return Ok(line);
            }
            if s.mute || s.paused {
                return Err(Error::Timeout(timeout));
            }
            s.next_packet().ok_or(Error::Timeout(timeout))
        })
    }

    fn close(&mut self) {
        self.with_state(|s| s.closed = true);
    }

    fn describe(&self) -> String {
        "sim".into()
    }
}
