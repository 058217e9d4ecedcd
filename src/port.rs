use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace, warn};

use crate::config::{Connection, SessionConfig};
use crate::error::{Error, Result};

/// A line-framed link to the instrument.
///
/// Implementations do no queuing: the caller guarantees at most one exchange
/// in flight.
pub trait Transport: Send {
    /// Write `line` followed by the line ending.
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Next complete line without its terminator. Fails with
    /// [`Error::Timeout`] if no terminator arrives within `timeout`.
    fn recv_line(&mut self, timeout: Duration) -> Result<String>;

    /// Release the link. Safe to call more than once.
    fn close(&mut self);

    fn describe(&self) -> String;
}

pub fn open(conn: &Connection, config: &SessionConfig) -> Result<Box<dyn Transport>> {
    let label = conn.to_string();
    let transport: Box<dyn Transport> = match conn {
        Connection::Serial { path, baud } => {
            let port = open_serial(path, *baud, config.timeout).map_err(|source| {
                Error::Connect {
                    target: label.clone(),
                    source,
                }
            })?;
            Box::new(LineLink::new(port, label, &config.line_ending))
        }
        Connection::Network { host, port } => {
            let stream = open_tcp(host, *port, config.timeout).map_err(|source| {
                Error::Connect {
                    target: label.clone(),
                    source,
                }
            })?;
            Box::new(LineLink::new(stream, label, &config.line_ending))
        }
    };
    debug!(link = %transport.describe(), "transport open");
    Ok(transport)
}

fn open_serial(path: &str, baud: u32, timeout: Duration) -> io::Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud)
        .timeout(timeout)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open()?;
    // stale bytes from a previous session would be read as replies
    port.clear(ClearBuffer::Input)?;
    Ok(port)
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(ErrorKind::NotFound, "host resolved to no address")))
}

/// Byte stream with an adjustable read timeout.
pub trait Link: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    fn shutdown(&mut self) {}
}

impl Link for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

impl Link for TcpStream {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        TcpStream::set_read_timeout(self, Some(timeout))
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Longest unterminated line kept before the buffer is discarded.
pub const MAX_LINE_BYTES: usize = 4096;

/// Buffers partial reads until `\n`; a trailing `\r` is dropped.
pub struct LineLink<L> {
    link: Option<L>,
    buf: Vec<u8>,
    label: String,
    line_ending: String,
}

impl<L: Link> LineLink<L> {
    pub fn new(link: L, label: impl Into<String>, line_ending: &str) -> Self {
        Self {
            link: Some(link),
            buf: Vec::with_capacity(256),
            label: label.into(),
            line_ending: line_ending.to_string(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=end).collect();
        let text = String::from_utf8_lossy(&raw);
        Some(text.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl<L: Link> Transport for LineLink<L> {
    fn send_line(&mut self, line: &str) -> Result<()> {
        let link = self.link.as_mut().ok_or(Error::Closed)?;
        trace!(link = %self.label, "> {}", line);
        let mut out = Vec::with_capacity(line.len() + self.line_ending.len());
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(self.line_ending.as_bytes());
        link.write_all(&out)?;
        link.flush()?;
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_line() {
                trace!(link = %self.label, "< {}", line);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                let head = String::from_utf8_lossy(&self.buf[..64]).into_owned();
                self.buf.clear();
                warn!(link = %self.label, "discarded unterminated input");
                return Err(Error::MalformedReply {
                    command: "<read>".into(),
                    reply: head,
                    reason: format!("line exceeds {MAX_LINE_BYTES} bytes without terminator"),
                });
            }
            let link = self.link.as_mut().ok_or(Error::Closed)?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            link.set_read_timeout(deadline - now)?;
            let mut chunk = [0u8; 256];
            match link.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "link closed by peer",
                    )));
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
            debug!(link = %self.label, "transport closed");
        }
        self.buf.clear();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
