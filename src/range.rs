use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::proto::command::{Channel, Command};
use crate::session::Smu;

/// Symmetric (±) current range limits in amperes, ascending.
pub const CURRENT_RANGE_LIMITS: [f64; 5] = [1e-6, 25e-6, 650e-6, 15e-3, 180e-3];

/// Index into [`CURRENT_RANGE_LIMITS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CurrentRange(u8);

impl CurrentRange {
    pub const LOWEST: CurrentRange = CurrentRange(0);
    pub const HIGHEST: CurrentRange = CurrentRange(CURRENT_RANGE_LIMITS.len() as u8 - 1);

    pub fn new(index: usize) -> Result<Self> {
        if index < CURRENT_RANGE_LIMITS.len() {
            Ok(CurrentRange(index as u8))
        } else {
            Err(Error::InvalidRange(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn limit(self) -> f64 {
        CURRENT_RANGE_LIMITS[self.index()]
    }
}

impl fmt::Display for CurrentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (\u{b1}{})", self.0, describe_limit(self.limit()))
    }
}

pub fn current_range_limit(index: usize) -> Result<f64> {
    CurrentRange::new(index).map(CurrentRange::limit)
}

/// Smallest range whose limit covers `expected_max_current`, saturating at
/// the top range. The sign is ignored since ranges are symmetric.
pub fn select_range_for(expected_max_current: f64) -> CurrentRange {
    let magnitude = expected_max_current.abs();
    CURRENT_RANGE_LIMITS
        .iter()
        .position(|&limit| limit >= magnitude)
        .map(|i| CurrentRange(i as u8))
        .unwrap_or(CurrentRange::HIGHEST)
}

/// `650 uA`, `15 mA` style label.
pub fn describe_limit(amps: f64) -> String {
    if amps < 1e-3 {
        format!("{:.0} uA", amps * 1e6)
    } else {
        format!("{:.0} mA", amps * 1e3)
    }
}

impl Smu {
    /// Disable autoranging on `ch` and select the smallest range that covers
    /// `expected_max_current`.
    pub fn set_current_range_by_limit(
        &self,
        ch: Channel,
        expected_max_current: f64,
    ) -> Result<CurrentRange> {
        let range = select_range_for(expected_max_current);
        self.request(|io| {
            io.command(&Command::SetAutorange { ch, on: false })?;
            io.command(&Command::SetCurrentRange { ch, range })
        })?;
        debug!(channel = %ch, expected_max_current, %range, "selected current range");
        Ok(range)
    }
}
