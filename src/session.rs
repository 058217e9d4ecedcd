use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::config::{Connection, SessionConfig};
use crate::error::{Error, Result};
use crate::frame::parse_packet;
use crate::port::{self, Transport};
use crate::proto::command::{
    Channel, Command, Identity, Measurement, Mode, ProtectionLimits, StreamSample, Temperatures,
    VoltageRange, WifiStatus,
};
use crate::proto::parser::{self, BLOCK_END, ParseError, Reply, classify, format_command};
use crate::range::CurrentRange;
use crate::sweep::SweepState;

/// Most buffered stream samples kept for channels nobody is reading.
const MAX_PENDING_SAMPLES: usize = 4096;

/// An open connection to one instrument.
///
/// Every operation takes the session lock for its whole exchange, so an
/// `Smu` can be shared between threads (e.g. behind an `Arc`) without
/// interleaving wire traffic.
pub struct Smu {
    connection: Option<Connection>,
    config: SessionConfig,
    inner: Mutex<Inner>,
}

/// Everything guarded by the session lock.
pub(crate) struct Inner {
    transport: Option<Box<dyn Transport>>,
    timeout: Duration,
    pub(crate) stream_timeout: Duration,
    pub(crate) sweeps: [SweepState; 2],
    pub(crate) streaming: BTreeSet<Channel>,
    pub(crate) pending: VecDeque<StreamSample>,
}

impl Smu {
    pub fn open(connection: Connection) -> Result<Self> {
        Self::open_with(connection, SessionConfig::default())
    }

    pub fn open_with(connection: Connection, config: SessionConfig) -> Result<Self> {
        let transport = port::open(&connection, &config)?;
        let mut smu = Self::from_transport(transport, config);
        smu.connection = Some(connection);
        Ok(smu)
    }

    /// Wrap an already open transport. Such a session cannot `reconnect`.
    pub fn from_transport(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            connection: None,
            inner: Mutex::new(Inner::new(Some(transport), &config)),
            config,
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.lock().transport.is_some()
    }

    /// Stop any active stream and release the transport. Never fails;
    /// cleanup errors are logged.
    pub fn close(&self) {
        let mut io = self.lock();
        io.shutdown();
    }

    /// Drop the current transport (if any) and open a fresh one from the
    /// original connection descriptor. All protocol state is reset.
    pub fn reconnect(&self) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(Error::Closed)?;
        let mut io = self.lock();
        io.shutdown();
        let transport = port::open(connection, &self.config)?;
        *io = Inner::new(Some(transport), &self.config);
        debug!(%connection, "reconnected");
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock with the transport in request/response mode.
    pub(crate) fn request<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut io = self.lock();
        io.ensure_request_mode()?;
        f(&mut io)
    }

    // ---- identity & system ----

    pub fn identity(&self) -> Result<Identity> {
        self.request(|io| io.query_with(&Command::Identify, parser::parse_identity))
    }

    /// ADC and per-channel sensor temperatures.
    pub fn temperatures(&self) -> Result<Temperatures> {
        self.request(|io| io.query_with(&Command::Temperatures, parser::parse_temperatures))
    }

    pub fn set_time(&self, unix_ms: u64) -> Result<()> {
        self.request(|io| io.command(&Command::SetTime { unix_ms }))
    }

    /// Set the device clock to the host's wall clock.
    pub fn sync_time(&self) -> Result<()> {
        self.set_time(unix_millis(SystemTime::now())?)
    }

    // ---- four-wire ----

    pub fn enable_fourwire_mode(&self) -> Result<()> {
        self.set_fourwire_mode(true)
    }

    pub fn disable_fourwire_mode(&self) -> Result<()> {
        self.set_fourwire_mode(false)
    }

    fn set_fourwire_mode(&self, on: bool) -> Result<()> {
        let mut io = self.lock();
        if let Some(ch) = io.streaming.iter().next() {
            return Err(Error::ModeConflict(format!(
                "cannot toggle four-wire mode while channel {ch} is streaming"
            )));
        }
        if let Some(ch) = io.running_sweep() {
            return Err(Error::ModeConflict(format!(
                "cannot toggle four-wire mode while a sweep runs on channel {ch}"
            )));
        }
        io.command(&Command::FourWire(on))?;
        debug!(enabled = on, "four-wire mode");
        Ok(())
    }

    pub fn fourwire_mode(&self) -> Result<bool> {
        self.request(|io| io.query_with(&Command::FourWireQuery, parser::parse_bool))
    }

    // ---- wifi ----

    pub fn wifi_status(&self) -> Result<WifiStatus> {
        self.request(|io| io.query_with(&Command::WifiStatus, parser::parse_wifi_status))
    }

    pub fn set_wifi_autoconnect(&self, on: bool) -> Result<()> {
        self.request(|io| io.command(&Command::WifiAutoconnect(on)))
    }

    pub fn wifi_autoconnect(&self) -> Result<bool> {
        self.request(|io| io.query_with(&Command::WifiAutoconnectQuery, parser::parse_bool))
    }

    // ---- source ----

    pub fn set_mode(&self, ch: Channel, mode: Mode) -> Result<()> {
        self.request(|io| io.command(&Command::SetMode { ch, mode }))
    }

    pub fn mode(&self, ch: Channel) -> Result<Mode> {
        self.request(|io| io.query_with(&Command::ModeQuery(ch), parser::parse_mode))
    }

    pub fn set_voltage(&self, ch: Channel, volts: f64) -> Result<()> {
        finite("voltage", volts)?;
        self.request(|io| io.command(&Command::SetVoltage { ch, volts }))
    }

    /// Voltage setpoint (not a measurement).
    pub fn voltage(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::VoltageQuery(ch), parser::parse_f64))
    }

    pub fn set_current(&self, ch: Channel, amps: f64) -> Result<()> {
        finite("current", amps)?;
        self.request(|io| io.command(&Command::SetCurrent { ch, amps }))
    }

    /// Current setpoint (not a measurement).
    pub fn current(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::CurrentQuery(ch), parser::parse_f64))
    }

    pub fn enable_channel(&self, ch: Channel) -> Result<()> {
        self.request(|io| io.command(&Command::Output { ch, on: true }))
    }

    pub fn disable_channel(&self, ch: Channel) -> Result<()> {
        self.request(|io| io.command(&Command::Output { ch, on: false }))
    }

    pub fn is_channel_enabled(&self, ch: Channel) -> Result<bool> {
        self.request(|io| io.query_with(&Command::OutputQuery(ch), parser::parse_bool))
    }

    // ---- protection ----

    pub fn set_voltage_protection(&self, ch: Channel, volts: f64) -> Result<()> {
        finite("voltage protection", volts)?;
        self.request(|io| io.command(&Command::SetVoltageProtection { ch, volts }))
    }

    pub fn voltage_protection(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::VoltageProtectionQuery(ch), parser::parse_f64))
    }

    pub fn set_current_protection(&self, ch: Channel, amps: f64) -> Result<()> {
        finite("current protection", amps)?;
        self.request(|io| io.command(&Command::SetCurrentProtection { ch, amps }))
    }

    pub fn current_protection(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::CurrentProtectionQuery(ch), parser::parse_f64))
    }

    pub fn set_protection_limits(&self, ch: Channel, limits: ProtectionLimits) -> Result<()> {
        finite("voltage protection", limits.voltage)?;
        finite("current protection", limits.current)?;
        self.request(|io| {
            io.command(&Command::SetVoltageProtection {
                ch,
                volts: limits.voltage,
            })?;
            io.command(&Command::SetCurrentProtection {
                ch,
                amps: limits.current,
            })
        })
    }

    pub fn protection_limits(&self, ch: Channel) -> Result<ProtectionLimits> {
        self.request(|io| {
            Ok(ProtectionLimits {
                voltage: io.query_with(&Command::VoltageProtectionQuery(ch), parser::parse_f64)?,
                current: io.query_with(&Command::CurrentProtectionQuery(ch), parser::parse_f64)?,
            })
        })
    }

    // ---- ranging ----

    pub fn set_voltage_range(&self, ch: Channel, range: VoltageRange) -> Result<()> {
        self.request(|io| io.command(&Command::SetVoltageRange { ch, range }))
    }

    /// Select a fixed current range. Autoranging is switched off first.
    pub fn set_current_range(&self, ch: Channel, range: CurrentRange) -> Result<()> {
        self.request(|io| {
            io.command(&Command::SetAutorange { ch, on: false })?;
            io.command(&Command::SetCurrentRange { ch, range })
        })
    }

    pub fn current_range(&self, ch: Channel) -> Result<CurrentRange> {
        let cmd = Command::CurrentRangeQuery(ch);
        let index = self.request(|io| io.query_with(&cmd, parser::parse_u8))?;
        CurrentRange::new(index as usize).map_err(|_| Error::MalformedReply {
            command: format_command(&cmd),
            reply: index.to_string(),
            reason: "current range index out of bounds".into(),
        })
    }

    pub fn set_autorange(&self, ch: Channel, on: bool) -> Result<()> {
        self.request(|io| io.command(&Command::SetAutorange { ch, on }))
    }

    pub fn autorange(&self, ch: Channel) -> Result<bool> {
        self.request(|io| io.query_with(&Command::AutorangeQuery(ch), parser::parse_bool))
    }

    // ---- measurement ----

    /// Oversampling ratio; valid ratios are 0..=15.
    pub fn set_oversampling_ratio(&self, ch: Channel, ratio: u8) -> Result<()> {
        if ratio > 15 {
            return Err(Error::InvalidConfig(format!(
                "oversampling ratio must be 0..=15, got {ratio}"
            )));
        }
        self.request(|io| io.command(&Command::SetOversampling { ch, ratio }))
    }

    pub fn measure_voltage(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::MeasureVoltage(ch), parser::parse_f64))
    }

    pub fn measure_current(&self, ch: Channel) -> Result<f64> {
        self.request(|io| io.query_with(&Command::MeasureCurrent(ch), parser::parse_f64))
    }

    pub fn measure_voltage_and_current(&self, ch: Channel) -> Result<Measurement> {
        self.request(|io| io.query_with(&Command::MeasureBoth(ch), parser::parse_measurement))
    }
}

impl Drop for Smu {
    fn drop(&mut self) {
        self.close();
    }
}

fn unix_millis(t: SystemTime) -> Result<u64> {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| Error::InvalidConfig("host clock is before the unix epoch".into()))
}

fn finite(what: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{what} must be finite, got {value}")))
    }
}

impl Inner {
    fn new(transport: Option<Box<dyn Transport>>, config: &SessionConfig) -> Self {
        Self {
            transport,
            timeout: config.timeout,
            stream_timeout: config.stream_timeout,
            sweeps: Default::default(),
            streaming: BTreeSet::new(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(Error::Closed)
    }

    pub(crate) fn ensure_request_mode(&self) -> Result<()> {
        match self.streaming.iter().next() {
            Some(ch) => Err(Error::ModeConflict(format!(
                "channel {ch} is streaming; stop the stream first"
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn running_sweep(&self) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|ch| matches!(self.sweeps[ch.slot()], SweepState::Running(_)))
    }

    /// Close the transport after a command timed out: the one-reply-per-
    /// command ordering can no longer be trusted.
    fn desync(&mut self, wire: &str) {
        warn!(command = wire, "reply timed out; closing session");
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.streaming.clear();
        self.pending.clear();
    }

    pub(crate) fn shutdown(&mut self) {
        if self.transport.is_none() {
            return;
        }
        let active: Vec<Channel> = self.streaming.iter().copied().collect();
        for ch in active {
            if let Err(e) = self.stop_stream(ch) {
                warn!(channel = %ch, error = %e, "failed to stop stream during close");
            }
        }
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.streaming.clear();
        self.pending.clear();
    }

    /// Send `cmd` and return the first line that is not a stream packet.
    ///
    /// Packets that arrive ahead of the reply are buffered when their
    /// channel is streaming (and is not `discard`) and dropped otherwise.
    pub(crate) fn exchange(&mut self, cmd: &Command, discard: Option<Channel>) -> Result<String> {
        let wire = format_command(cmd);
        self.transport()?.send_line(&wire)?;
        self.next_reply(&wire, discard)
    }

    fn next_reply(&mut self, wire: &str, discard: Option<Channel>) -> Result<String> {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.transport()?.recv_line(remaining) {
                Ok(line) => line,
                Err(Error::Timeout(_)) => {
                    self.desync(wire);
                    return Err(Error::Timeout(timeout));
                }
                Err(e) => return Err(e),
            };
            match parse_packet(&line) {
                None => return Ok(line),
                Some(Ok(sample)) => {
                    if Some(sample.channel) != discard && self.streaming.contains(&sample.channel) {
                        self.buffer_sample(sample);
                    } else {
                        trace!(command = wire, channel = %sample.channel, "dropped stream packet");
                    }
                }
                Some(Err(e)) => {
                    warn!(command = wire, packet = %line, error = %e, "dropped corrupt stream packet");
                }
            }
        }
    }

    /// Multi-line query: a JSON document on one line, or CSV rows up to the
    /// `END` marker. The marker is not part of the returned text.
    pub(crate) fn query_block(&mut self, cmd: &Command) -> Result<String> {
        let first = self.query(cmd)?;
        if first.starts_with('{') {
            return Ok(first);
        }
        let wire = format_command(cmd);
        let mut rows = Vec::new();
        let mut line = first;
        while line.trim() != BLOCK_END {
            rows.push(line.trim().to_string());
            line = self.next_reply(&wire, None)?;
        }
        Ok(rows.join("\n"))
    }

    pub(crate) fn buffer_sample(&mut self, sample: StreamSample) {
        if self.pending.len() >= MAX_PENDING_SAMPLES {
            self.pending.pop_front();
            warn!("stream buffer full; dropping oldest sample");
        }
        self.pending.push_back(sample);
    }

    /// Setter/action: expects `OK`.
    pub(crate) fn command(&mut self, cmd: &Command) -> Result<()> {
        let line = self.exchange(cmd, None)?;
        expect_ack(cmd, &line)
    }

    /// Query: expects a value line.
    pub(crate) fn query(&mut self, cmd: &Command) -> Result<String> {
        let line = self.exchange(cmd, None)?;
        value_of(cmd, &line).map(str::to_string)
    }

    pub(crate) fn query_with<T>(
        &mut self,
        cmd: &Command,
        parse: fn(&str) -> std::result::Result<T, ParseError>,
    ) -> Result<T> {
        let reply = self.query(cmd)?;
        parse(&reply).map_err(|e| malformed(&format_command(cmd), &reply, e))
    }
}

pub(crate) fn expect_ack(cmd: &Command, line: &str) -> Result<()> {
    match classify(line) {
        Reply::Ok => Ok(()),
        Reply::Error(msg) => Err(Error::from_device(msg)),
        Reply::Value(v) => Err(Error::MalformedReply {
            command: format_command(cmd),
            reply: v.to_string(),
            reason: "expected OK".into(),
        }),
    }
}

pub(crate) fn value_of<'a>(cmd: &Command, line: &'a str) -> Result<&'a str> {
    match classify(line) {
        Reply::Value(v) => Ok(v),
        Reply::Error(msg) => Err(Error::from_device(msg)),
        Reply::Ok => Err(Error::MalformedReply {
            command: format_command(cmd),
            reply: line.to_string(),
            reason: "expected a value, got OK".into(),
        }),
    }
}

pub(crate) fn malformed(command: &str, reply: &str, e: ParseError) -> Error {
    Error::MalformedReply {
        command: command.to_string(),
        reply: reply.to_string(),
        reason: e.to_string(),
    }
}
