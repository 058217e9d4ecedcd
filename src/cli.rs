use clap::{Args, Parser, Subcommand, ValueEnum};
use minismu::{Channel, Connection};

use crate::logging::{LogFormat, LogLevel};

#[derive(Parser, Debug, Clone)]
#[command(name = "minismu", about = "Drive a miniSMU source-measure unit over USB serial or TCP")]
pub struct Cli {
    /// serial:<path>[@baud], tcp:<host>[:port], or a bare serial path
    #[arg(long, global = true, default_value = "/dev/ttyACM0")]
    pub conn: Connection,
    /// Reply timeout per command
    #[arg(long, global = true, default_value_t = 1000)]
    pub timeout_ms: u64,
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Print the identification string
    Idn,
    /// Print ADC and channel temperatures
    Temps,
    /// Set a voltage (optional) and read back voltage and current
    Measure(MeasureOpts),
    /// Run an on-board I-V sweep and print the data
    Sweep(SweepOpts),
    /// Stream samples from one channel
    Stream(StreamOpts),
    /// List current ranges, or pick one for an expected current
    Ranges(RangeOpts),
    /// Query or switch four-wire (Kelvin) sensing
    Fourwire {
        #[arg(value_enum)]
        state: Option<Toggle>,
    },
    /// Show wifi status, optionally setting autoconnect
    Wifi {
        #[arg(long, value_enum)]
        autoconnect: Option<Toggle>,
    },
    /// Set the device clock to the host's time
    SyncTime,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Args, Debug, Clone)]
pub struct MeasureOpts {
    #[arg(long, default_value = "1", value_parser = parse_channel)]
    pub ch: Channel,
    /// Force this voltage (FVMI) and enable the output first
    #[arg(long, allow_negative_numbers = true)]
    pub volts: Option<f64>,
    /// Oversampling ratio 0..=15
    #[arg(long)]
    pub osr: Option<u8>,
}

#[derive(Args, Debug, Clone)]
pub struct SweepOpts {
    #[arg(long, default_value = "1", value_parser = parse_channel)]
    pub ch: Channel,
    #[arg(long, allow_negative_numbers = true, default_value_t = 0.0)]
    pub start: f64,
    #[arg(long, allow_negative_numbers = true, default_value_t = 1.0)]
    pub end: f64,
    #[arg(long, default_value_t = 21)]
    pub points: u32,
    #[arg(long, default_value_t = 100)]
    pub dwell_ms: i64,
    /// Leave the output state alone instead of switching it for the sweep
    #[arg(long, default_value_t = false)]
    pub manual_output: bool,
    /// Print the report as JSON instead of CSV
    #[arg(long, default_value_t = false)]
    pub json: bool,
    /// Status poll interval
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StreamOpts {
    #[arg(long, default_value = "1", value_parser = parse_channel)]
    pub ch: Channel,
    /// Stop after this many samples
    #[arg(long, default_value_t = 100)]
    pub samples: usize,
    /// Sample rate in Hz
    #[arg(long)]
    pub rate: Option<f64>,
    /// Stats log interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

#[derive(Args, Debug, Clone)]
pub struct RangeOpts {
    #[arg(long, default_value = "1", value_parser = parse_channel)]
    pub ch: Channel,
    /// Fix the range for this expected peak current (A)
    #[arg(long, allow_negative_numbers = true)]
    pub expect: Option<f64>,
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    let n: u8 = s.parse().map_err(|_| format!("{s:?} is not a channel number"))?;
    Channel::try_from(n).map_err(|e| e.to_string())
}
