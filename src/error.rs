use std::time::Duration;

use thiserror::Error;

/// Every failure a session operation can report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply to {command:?}: {reply:?} ({reason})")]
    MalformedReply {
        command: String,
        reply: String,
        reason: String,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error("mode conflict: {0}")]
    ModeConflict(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("current range index {0} out of bounds (0..=4)")]
    InvalidRange(usize),
    #[error("no sweep configured on channel {0}")]
    NotConfigured(u8),
    #[error("sweep on channel {0} has not completed")]
    SweepNotComplete(u8),
    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a device refusal onto the interlock variant when it names one.
    pub(crate) fn from_device(message: String) -> Self {
        let upper = message.to_ascii_uppercase();
        if upper.contains("CONFLICT") || upper.contains("BUSY") {
            Error::ModeConflict(message)
        } else {
            Error::Device(message)
        }
    }
}
