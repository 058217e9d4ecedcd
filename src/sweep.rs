use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proto::command::{Channel, Command, OutputFormat, SweepDataPoint, SweepPhase, SweepStatus};
use crate::proto::parser::{self, format_command};
use crate::session::{Inner, Smu, malformed};

/// Parameters of a device-resident voltage sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub points: u32,
    pub dwell_ms: i64,
    /// Let the device switch the output on for the sweep and off after it.
    #[serde(default = "default_auto_enable")]
    pub auto_enable: bool,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
}

fn default_auto_enable() -> bool {
    true
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Csv
}

impl SweepConfig {
    pub fn new(start_voltage: f64, end_voltage: f64, points: u32, dwell_ms: i64) -> Self {
        Self {
            start_voltage,
            end_voltage,
            points,
            dwell_ms,
            auto_enable: default_auto_enable(),
            output_format: default_output_format(),
        }
    }

    pub fn with_auto_enable(mut self, on: bool) -> Self {
        self.auto_enable = on;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.points < 2 {
            return Err(Error::InvalidConfig(format!(
                "sweep needs at least 2 points, got {}",
                self.points
            )));
        }
        if self.dwell_ms < 0 {
            return Err(Error::InvalidConfig(format!(
                "dwell must not be negative, got {} ms",
                self.dwell_ms
            )));
        }
        if !self.start_voltage.is_finite() || !self.end_voltage.is_finite() {
            return Err(Error::InvalidConfig("sweep voltages must be finite".into()));
        }
        Ok(())
    }

    /// Voltage increment between consecutive points.
    pub fn step(&self) -> f64 {
        (self.end_voltage - self.start_voltage) / (self.points.max(2) - 1) as f64
    }

    pub fn voltage_at(&self, index: u32) -> f64 {
        self.start_voltage + index as f64 * self.step()
    }

    /// Lower bound on the sweep's run time.
    pub fn nominal_duration(&self) -> Duration {
        Duration::from_millis(self.points as u64 * self.dwell_ms.max(0) as u64)
    }

    fn commands(&self, ch: Channel) -> [Command; 6] {
        [
            Command::SweepStart {
                ch,
                volts: self.start_voltage,
            },
            Command::SweepEnd {
                ch,
                volts: self.end_voltage,
            },
            Command::SweepPoints {
                ch,
                points: self.points,
            },
            Command::SweepDwell {
                ch,
                ms: self.dwell_ms,
            },
            Command::SweepAutoOutput {
                ch,
                on: self.auto_enable,
            },
            Command::SweepFormat {
                ch,
                format: self.output_format,
            },
        ]
    }
}

/// Sweep data together with the configuration that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub config: SweepConfig,
    pub data: Vec<SweepDataPoint>,
}

/// Client-side view of one channel's sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SweepState {
    #[default]
    Idle,
    Configured(SweepConfig),
    Running(SweepConfig),
    Completed(SweepConfig),
    Aborted(SweepConfig),
}

impl SweepState {
    pub fn config(&self) -> Option<&SweepConfig> {
        match self {
            SweepState::Idle => None,
            SweepState::Configured(c)
            | SweepState::Running(c)
            | SweepState::Completed(c)
            | SweepState::Aborted(c) => Some(c),
        }
    }

    fn config_mut(&mut self) -> Option<&mut SweepConfig> {
        match self {
            SweepState::Idle => None,
            SweepState::Configured(c)
            | SweepState::Running(c)
            | SweepState::Completed(c)
            | SweepState::Aborted(c) => Some(c),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SweepState::Running(_))
    }
}

/// Outcome of [`Smu::run_iv_sweep`]. An aborted sweep is a result, not an
/// error; `data` then holds whatever the device collected.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub config: SweepConfig,
    pub phase: SweepPhase,
    pub data: Vec<SweepDataPoint>,
}

impl SweepResult {
    pub fn is_complete(&self) -> bool {
        self.phase == SweepPhase::Completed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl SweepOptions {
    /// Twice the nominal run time plus a fixed margin.
    pub fn for_config(config: &SweepConfig) -> Self {
        Self {
            max_wait: config.nominal_duration() * 2 + Duration::from_secs(5),
            ..Self::default()
        }
    }
}

impl Inner {
    /// Poll the device and fold terminal phases into the client state.
    fn refresh_sweep(&mut self, ch: Channel) -> Result<SweepStatus> {
        let status = self.query_with(&Command::SweepStatus(ch), parser::parse_sweep_status)?;
        let SweepState::Running(cfg) = &self.sweeps[ch.slot()] else {
            return Ok(status);
        };
        let next = match status.phase {
            SweepPhase::Running => return Ok(status),
            SweepPhase::Completed => SweepState::Completed(cfg.clone()),
            SweepPhase::Aborted => SweepState::Aborted(cfg.clone()),
            SweepPhase::Idle => {
                warn!(channel = %ch, "device reports no sweep; treating as aborted");
                SweepState::Aborted(cfg.clone())
            }
        };
        debug!(channel = %ch, phase = %status.phase, "sweep finished");
        self.sweeps[ch.slot()] = next;
        Ok(status)
    }

    fn reject_running(&self, ch: Channel) -> Result<()> {
        if self.sweeps[ch.slot()].is_running() {
            return Err(Error::ModeConflict(format!(
                "a sweep is running on channel {ch}"
            )));
        }
        Ok(())
    }

    /// Fetch the data block and reset the channel to `Idle`. `None` means
    /// the device had nothing to report for an aborted sweep.
    fn take_sweep_data(&mut self, ch: Channel) -> Result<(SweepConfig, Option<String>)> {
        if self.sweeps[ch.slot()].is_running() {
            self.refresh_sweep(ch)?;
        }
        let (config, aborted) = match &self.sweeps[ch.slot()] {
            SweepState::Completed(c) => (c.clone(), false),
            SweepState::Aborted(c) => (c.clone(), true),
            _ => return Err(Error::SweepNotComplete(ch.index())),
        };
        let text = match self.query_block(&Command::SweepData(ch)) {
            Ok(text) => Some(text),
            Err(Error::Device(msg)) if aborted => {
                debug!(channel = %ch, reason = %msg, "no data for aborted sweep");
                None
            }
            Err(e) => return Err(e),
        };
        self.sweeps[ch.slot()] = SweepState::Idle;
        Ok((config, text))
    }
}

/// Decode a data block by shape: a JSON document or CSV rows.
fn decode_report(ch: Channel, config: SweepConfig, text: &str) -> Result<SweepReport> {
    let command = || format_command(&Command::SweepData(ch));
    if text.trim_start().starts_with('{') {
        parser::parse_sweep_json(text).map_err(|e| malformed(&command(), text, e))
    } else {
        let data = parser::parse_sweep_csv(text).map_err(|e| malformed(&command(), text, e))?;
        Ok(SweepReport { config, data })
    }
}

impl Smu {
    /// Push `config` to the device. Allowed in every state except `Running`.
    pub fn configure_sweep(&self, ch: Channel, config: SweepConfig) -> Result<()> {
        config.validate()?;
        self.request(|io| {
            io.reject_running(ch)?;
            for cmd in config.commands(ch) {
                io.command(&cmd)?;
            }
            debug!(channel = %ch, ?config, "sweep configured");
            io.sweeps[ch.slot()] = SweepState::Configured(config);
            Ok(())
        })
    }

    pub fn execute_sweep(&self, ch: Channel) -> Result<()> {
        self.request(|io| {
            let config = match &io.sweeps[ch.slot()] {
                SweepState::Idle => return Err(Error::NotConfigured(ch.index())),
                SweepState::Running(_) => {
                    return Err(Error::ModeConflict(format!(
                        "a sweep is already running on channel {ch}"
                    )));
                }
                SweepState::Configured(c) | SweepState::Completed(c) | SweepState::Aborted(c) => {
                    c.clone()
                }
            };
            io.command(&Command::SweepExecute(ch))?;
            info!(channel = %ch, points = config.points, "sweep started");
            io.sweeps[ch.slot()] = SweepState::Running(config);
            Ok(())
        })
    }

    pub fn sweep_status(&self, ch: Channel) -> Result<SweepStatus> {
        self.request(|io| io.refresh_sweep(ch))
    }

    /// Ask the device to stop a running sweep. A no-op in any other state;
    /// the client state changes once a status poll reports the abort.
    pub fn abort_sweep(&self, ch: Channel) -> Result<()> {
        self.request(|io| {
            if !io.sweeps[ch.slot()].is_running() {
                return Ok(());
            }
            io.command(&Command::SweepAbort(ch))?;
            debug!(channel = %ch, "sweep abort requested");
            Ok(())
        })
    }

    pub fn sweep_state(&self, ch: Channel) -> SweepState {
        self.lock().sweeps[ch.slot()].clone()
    }

    /// Data points of a finished sweep. Returns the channel to `Idle`.
    pub fn sweep_data(&self, ch: Channel) -> Result<Vec<SweepDataPoint>> {
        Ok(self.sweep_data_json(ch)?.data)
    }

    /// Like [`Smu::sweep_data`], but keeps the configuration alongside. For
    /// CSV output the configuration is the one this session pushed.
    pub fn sweep_data_json(&self, ch: Channel) -> Result<SweepReport> {
        let (config, text) = self.request(|io| io.take_sweep_data(ch))?;
        match text {
            Some(text) => decode_report(ch, config, &text),
            None => Ok(SweepReport {
                config,
                data: Vec::new(),
            }),
        }
    }

    /// Device text as sent: CSV rows joined with `\n` or one JSON document.
    pub fn sweep_data_raw(&self, ch: Channel) -> Result<String> {
        let (_, text) = self.request(|io| io.take_sweep_data(ch))?;
        Ok(text.unwrap_or_default())
    }

    pub fn set_sweep_output_format(&self, ch: Channel, format: OutputFormat) -> Result<()> {
        self.request(|io| {
            io.reject_running(ch)?;
            io.command(&Command::SweepFormat { ch, format })?;
            if let Some(c) = io.sweeps[ch.slot()].config_mut() {
                c.output_format = format;
            }
            Ok(())
        })
    }

    pub fn sweep_output_format(&self, ch: Channel) -> Result<OutputFormat> {
        self.request(|io| io.query_with(&Command::SweepFormatQuery(ch), parser::parse_output_format))
    }

    pub fn set_sweep_auto_output(&self, ch: Channel, on: bool) -> Result<()> {
        self.request(|io| {
            io.reject_running(ch)?;
            io.command(&Command::SweepAutoOutput { ch, on })?;
            if let Some(c) = io.sweeps[ch.slot()].config_mut() {
                c.auto_enable = on;
            }
            Ok(())
        })
    }

    pub fn sweep_auto_output(&self, ch: Channel) -> Result<bool> {
        self.request(|io| io.query_with(&Command::SweepAutoOutputQuery(ch), parser::parse_bool))
    }

    /// Configure, execute and wait for a sweep, then fetch its data.
    ///
    /// `observer` sees every status poll. If the sweep outlives
    /// `options.max_wait` it is aborted and `Timeout` is returned.
    pub fn run_iv_sweep(
        &self,
        ch: Channel,
        config: SweepConfig,
        options: SweepOptions,
        mut observer: impl FnMut(&SweepStatus),
    ) -> Result<SweepResult> {
        self.configure_sweep(ch, config.clone())?;
        self.execute_sweep(ch)?;
        let started = Instant::now();
        let phase = loop {
            let status = self.sweep_status(ch)?;
            observer(&status);
            match self.sweep_state(ch) {
                SweepState::Completed(_) => break SweepPhase::Completed,
                SweepState::Aborted(_) => break SweepPhase::Aborted,
                _ => {}
            }
            let elapsed = started.elapsed();
            if elapsed >= options.max_wait {
                warn!(channel = %ch, ?elapsed, "sweep overran its wait budget; aborting");
                if let Err(e) = self.abort_sweep(ch) {
                    warn!(channel = %ch, error = %e, "sweep abort failed");
                }
                return Err(Error::Timeout(options.max_wait));
            }
            thread::sleep(options.poll_interval.min(options.max_wait - elapsed));
        };
        let data = self.sweep_data(ch)?;
        info!(channel = %ch, %phase, points = data.len(), "sweep done");
        Ok(SweepResult {
            config,
            phase,
            data,
        })
    }
}
