use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::parse_packet;
use crate::proto::command::{Channel, Command, StreamSample};
use crate::session::{Inner, Smu, expect_ack, malformed};

/// Pseudo command name used in errors raised while reading packets.
const STREAM: &str = "<stream>";

impl Inner {
    /// Next packet for `only` (or any active channel). Buffered samples go
    /// first; packets of other active channels are buffered on the way.
    fn next_sample(&mut self, only: Option<Channel>) -> Result<StreamSample> {
        match only {
            Some(ch) if !self.streaming.contains(&ch) => {
                return Err(Error::ModeConflict(format!("channel {ch} is not streaming")));
            }
            None if self.streaming.is_empty() => {
                return Err(Error::ModeConflict("no channel is streaming".into()));
            }
            _ => {}
        }
        let wanted = |s: &StreamSample| only.is_none_or(|ch| s.channel == ch);
        if let Some(pos) = self.pending.iter().position(wanted)
            && let Some(sample) = self.pending.remove(pos)
        {
            return Ok(sample);
        }

        let timeout = self.stream_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.transport()?.recv_line(remaining) {
                Ok(line) => line,
                // a quiet stream is not a protocol fault; the session stays usable
                Err(Error::Timeout(_)) => return Err(Error::Timeout(timeout)),
                Err(e) => return Err(e),
            };
            match parse_packet(&line) {
                Some(Ok(sample)) if !self.streaming.contains(&sample.channel) => {
                    trace!(channel = %sample.channel, "dropped packet of stopped channel");
                }
                Some(Ok(sample)) if wanted(&sample) => return Ok(sample),
                Some(Ok(sample)) => self.buffer_sample(sample),
                Some(Err(e)) => return Err(malformed(STREAM, &line, e)),
                None => {
                    return Err(Error::MalformedReply {
                        command: STREAM.into(),
                        reply: line,
                        reason: "expected a stream packet".into(),
                    });
                }
            }
        }
    }

    /// Stop `ch`. Its in-flight packets are discarded, other channels'
    /// packets are kept, and no sample of `ch` survives the call.
    pub(crate) fn stop_stream(&mut self, ch: Channel) -> Result<()> {
        let was_active = self.streaming.contains(&ch);
        let cmd = Command::Stream { ch, on: false };
        let result = self
            .exchange(&cmd, Some(ch))
            .and_then(|line| expect_ack(&cmd, &line));
        self.streaming.remove(&ch);
        self.pending.retain(|s| s.channel != ch);
        match result {
            Ok(()) => {
                if was_active {
                    debug!(channel = %ch, "stream stopped");
                }
                Ok(())
            }
            Err(Error::Device(msg) | Error::ModeConflict(msg)) if !was_active => {
                trace!(channel = %ch, reason = %msg, "stop on idle stream refused; ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Smu {
    /// Stream packet rate in samples per second.
    pub fn set_sample_rate(&self, ch: Channel, hz: f64) -> Result<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "sample rate must be positive, got {hz}"
            )));
        }
        self.request(|io| io.command(&Command::SetSampleRate { ch, hz }))
    }

    /// Put `ch` into continuous mode. Request/response operations are
    /// refused until every stream is stopped.
    pub fn start_streaming(&self, ch: Channel) -> Result<()> {
        let mut io = self.lock();
        if io.streaming.contains(&ch) {
            return Ok(());
        }
        if let Some(running) = io.running_sweep() {
            return Err(Error::ModeConflict(format!(
                "cannot stream while a sweep runs on channel {running}"
            )));
        }
        io.command(&Command::Stream { ch, on: true })?;
        io.streaming.insert(ch);
        debug!(channel = %ch, "stream started");
        Ok(())
    }

    /// Next sample from any streaming channel.
    pub fn read_sample(&self) -> Result<StreamSample> {
        self.lock().next_sample(None)
    }

    /// Next sample from `ch`; samples of other channels are kept for later.
    pub fn read_sample_for(&self, ch: Channel) -> Result<StreamSample> {
        self.lock().next_sample(Some(ch))
    }

    /// Idempotent: stopping a channel that is not streaming succeeds.
    pub fn stop_streaming(&self, ch: Channel) -> Result<()> {
        self.lock().stop_stream(ch)
    }

    pub fn is_streaming(&self, ch: Channel) -> bool {
        self.lock().streaming.contains(&ch)
    }

    /// Start streaming `ch` and return a guard that stops it on drop.
    pub fn stream(&self, ch: Channel) -> Result<StreamSession<'_>> {
        self.start_streaming(ch)?;
        Ok(StreamSession {
            smu: self,
            channel: ch,
            active: true,
        })
    }
}

/// Scoped stream on one channel.
pub struct StreamSession<'a> {
    smu: &'a Smu,
    channel: Channel,
    active: bool,
}

impl StreamSession<'_> {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn next_sample(&mut self) -> Result<StreamSample> {
        self.smu.read_sample_for(self.channel)
    }

    /// Stop the stream, reporting any failure.
    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.smu.stop_streaming(self.channel)
    }
}

impl Drop for StreamSession<'_> {
    fn drop(&mut self) {
        if self.active
            && let Err(e) = self.smu.stop_streaming(self.channel)
        {
            warn!(channel = %self.channel, error = %e, "failed to stop stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::sim::SimSmu;
    use std::time::Duration;

    fn open() -> (Smu, SimSmu) {
        let sim = SimSmu::new();
        let config = SessionConfig::default().with_stream_timeout(Duration::from_millis(50));
        let smu = Smu::from_transport(Box::new(sim.clone()), config);
        (smu, sim)
    }

    #[test]
    fn sample_budget_then_stop() {
        let (smu, sim) = open();
        sim.with_state(|s| s.in_flight = 3);
        let ch = Channel::Ch1;
        smu.set_voltage(ch, 1.0).unwrap();
        smu.enable_channel(ch).unwrap();
        smu.start_streaming(ch).unwrap();

        let budget = 25;
        let samples: Vec<_> = (0..budget).map(|_| smu.read_sample().unwrap()).collect();
        assert_eq!(samples.len(), budget);
        assert!(samples.iter().all(|s| s.channel == ch));
        assert!(samples.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
        assert!((samples[0].current - 1.0e-3).abs() < 1e-12);

        smu.stop_streaming(ch).unwrap();
        assert!(!smu.is_streaming(ch));
        assert!(matches!(smu.read_sample(), Err(Error::ModeConflict(_))));
        // back in request mode
        assert!(smu.identity().is_ok());
    }

    #[test]
    fn requests_refused_while_streaming() {
        let (smu, _sim) = open();
        smu.start_streaming(Channel::Ch2).unwrap();
        assert!(matches!(
            smu.measure_voltage(Channel::Ch1),
            Err(Error::ModeConflict(_))
        ));
        assert!(matches!(
            smu.set_sample_rate(Channel::Ch2, 100.0),
            Err(Error::ModeConflict(_))
        ));
        smu.stop_streaming(Channel::Ch2).unwrap();
        smu.set_sample_rate(Channel::Ch2, 100.0).unwrap();
    }

    #[test]
    fn corrupt_packet_during_stop_is_skipped() {
        let (smu, sim) = open();
        smu.start_streaming(Channel::Ch1).unwrap();
        sim.with_state(|s| s.outbox.push_back("DATA 1,0.0,volts,0.0".into()));
        smu.stop_streaming(Channel::Ch1).unwrap();
        assert!(smu.identity().is_ok());
    }

    #[test]
    fn stop_is_idempotent() {
        let (smu, _sim) = open();
        smu.stop_streaming(Channel::Ch1).unwrap();
        smu.start_streaming(Channel::Ch1).unwrap();
        smu.stop_streaming(Channel::Ch1).unwrap();
        smu.stop_streaming(Channel::Ch1).unwrap();
    }

    #[test]
    fn fourwire_interlock() {
        let (smu, sim) = open();
        smu.start_streaming(Channel::Ch1).unwrap();
        let before = sim.sent().len();
        assert!(matches!(
            smu.enable_fourwire_mode(),
            Err(Error::ModeConflict(_))
        ));
        assert_eq!(sim.sent().len(), before);
        smu.stop_streaming(Channel::Ch1).unwrap();
        smu.enable_fourwire_mode().unwrap();
        assert!(smu.fourwire_mode().unwrap());
    }

    #[test]
    fn streaming_refused_during_sweep() {
        let (smu, _sim) = open();
        smu.configure_sweep(Channel::Ch1, crate::sweep::SweepConfig::new(0.0, 1.0, 50, 10))
            .unwrap();
        smu.execute_sweep(Channel::Ch1).unwrap();
        assert!(matches!(
            smu.start_streaming(Channel::Ch2),
            Err(Error::ModeConflict(_))
        ));
    }

    #[test]
    fn stopping_one_channel_keeps_the_other() {
        let (smu, sim) = open();
        sim.with_state(|s| s.in_flight = 4);
        smu.start_streaming(Channel::Ch1).unwrap();
        smu.start_streaming(Channel::Ch2).unwrap();
        // Ch1 packets that raced the second start were buffered
        assert_eq!(smu.read_sample().unwrap().channel, Channel::Ch1);

        let s = smu.read_sample_for(Channel::Ch2).unwrap();
        assert_eq!(s.channel, Channel::Ch2);

        smu.stop_streaming(Channel::Ch1).unwrap();
        for _ in 0..20 {
            assert_eq!(smu.read_sample().unwrap().channel, Channel::Ch2);
        }
        smu.stop_streaming(Channel::Ch2).unwrap();
    }

    #[test]
    fn quiet_stream_times_out_without_closing() {
        let (smu, sim) = open();
        smu.start_streaming(Channel::Ch1).unwrap();
        sim.with_state(|s| s.paused = true);
        assert!(matches!(smu.read_sample(), Err(Error::Timeout(_))));
        assert!(smu.is_open());
        sim.with_state(|s| s.paused = false);
        assert!(smu.read_sample().is_ok());
    }

    #[test]
    fn scoped_stream_stops_on_drop() {
        let (smu, sim) = open();
        {
            let mut stream = smu.stream(Channel::Ch2).unwrap();
            for _ in 0..5 {
                assert_eq!(stream.next_sample().unwrap().channel, Channel::Ch2);
            }
        }
        assert!(!smu.is_streaming(Channel::Ch2));
        assert_eq!(sim.sent().last().map(String::as_str), Some("SOUR2:STRM OFF"));

        let stream = smu.stream(Channel::Ch1).unwrap();
        stream.finish().unwrap();
        assert!(!smu.is_streaming(Channel::Ch1));
    }

    #[test]
    fn close_stops_active_streams() {
        let (smu, sim) = open();
        smu.start_streaming(Channel::Ch1).unwrap();
        smu.close();
        assert!(sim.sent().iter().any(|l| l == "SOUR1:STRM OFF"));
        assert!(sim.is_closed());
    }
}
