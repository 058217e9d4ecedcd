use std::time::{Duration, Instant};

use tracing::info;

use crate::proto::command::{Channel, StreamSample};

/// Running counters over a stream, per channel.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub samples: [u64; 2],
    pub gaps: u64,
    first_ts: [Option<f64>; 2],
    last_ts: [Option<f64>; 2],
    since: Instant,
    window: u64,
    last_report: Instant,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            samples: [0; 2],
            gaps: 0,
            first_ts: [None; 2],
            last_ts: [None; 2],
            since: Instant::now(),
            window: 0,
            last_report: Instant::now(),
        }
    }

    /// Count `sample`. A timestamp that does not advance counts as a gap.
    pub fn record(&mut self, sample: &StreamSample) {
        let slot = sample.channel.slot();
        self.samples[slot] += 1;
        self.window += 1;
        if let Some(prev) = self.last_ts[slot]
            && sample.timestamp <= prev
        {
            self.gaps += 1;
        }
        self.first_ts[slot].get_or_insert(sample.timestamp);
        self.last_ts[slot] = Some(sample.timestamp);
    }

    pub fn count(&self, ch: Channel) -> u64 {
        self.samples[ch.slot()]
    }

    pub fn total(&self) -> u64 {
        self.samples.iter().sum()
    }

    /// Sample rate implied by the device timestamps of `ch`.
    pub fn device_rate(&self, ch: Channel) -> Option<f64> {
        let slot = ch.slot();
        let span = self.last_ts[slot]? - self.first_ts[slot]?;
        (span > 0.0).then(|| (self.samples[slot] - 1) as f64 / span)
    }

    /// Log throughput once every `interval`.
    pub fn maybe_log(&mut self, interval: Duration) {
        if self.last_report.elapsed() < interval {
            return;
        }
        let dur = self.since.elapsed().as_secs_f64().max(1e-3);
        info!(
            ch1 = self.samples[0],
            ch2 = self.samples[1],
            gaps = self.gaps,
            rate = format_args!("{:.1}/s", self.window as f64 / dur),
            "stream"
        );
        self.window = 0;
        self.since = Instant::now();
        self.last_report = Instant::now();
    }
}
