//! Blocking driver for the miniSMU two-channel source-measure unit, over a
//! serial port or TCP.

pub mod config;
pub mod error;
pub mod frame;
pub mod port;
pub mod proto;
pub mod range;
pub mod session;
pub mod stats;
pub mod stream;
pub mod sweep;

#[cfg(test)]
mod sim;

pub use config::{Connection, SessionConfig};
pub use error::{Error, Result};
pub use proto::command::{
    Channel, Identity, Measurement, Mode, OutputFormat, ProtectionLimits, StreamSample,
    SweepDataPoint, SweepPhase, SweepStatus, Temperatures, VoltageRange, WifiStatus,
};
pub use range::{CURRENT_RANGE_LIMITS, CurrentRange, select_range_for};
pub use session::Smu;
pub use stats::StreamStats;
pub use stream::StreamSession;
pub use sweep::{SweepConfig, SweepOptions, SweepReport, SweepResult, SweepState};
