use std::{fmt, str::FromStr, time::Duration};

use crate::error::Error;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_TCP_PORT: u16 = 3333;

/// Which physical link a session talks over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Serial { path: String, baud: u32 },
    Network { host: String, port: u16 },
}

impl Connection {
    pub fn serial(path: impl Into<String>) -> Self {
        Connection::Serial {
            path: path.into(),
            baud: DEFAULT_BAUD,
        }
    }

    pub fn network(host: impl Into<String>) -> Self {
        Connection::Network {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Serial { path, baud } => write!(f, "serial:{path}@{baud}"),
            Connection::Network { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// `serial:<path>[@<baud>]`, `tcp:<host>[:<port>]`, or a bare serial path.
impl FromStr for Connection {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidConfig("empty connection string".into()));
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::InvalidConfig(format!("invalid tcp port {port:?}"))
                    })?;
                    (host, port)
                }
                None => (rest, DEFAULT_TCP_PORT),
            };
            if host.is_empty() {
                return Err(Error::InvalidConfig("missing tcp host".into()));
            }
            return Ok(Connection::Network {
                host: host.to_string(),
                port,
            });
        }
        let rest = s.strip_prefix("serial:").unwrap_or(s);
        let (path, baud) = match rest.rsplit_once('@') {
            Some((path, baud)) => {
                let baud = baud
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidConfig(format!("invalid baud rate {baud:?}")))?;
                (path, baud)
            }
            None => (rest, DEFAULT_BAUD),
        };
        if path.is_empty() {
            return Err(Error::InvalidConfig("missing serial path".into()));
        }
        Ok(Connection::Serial {
            path: path.to_string(),
            baud,
        })
    }
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on every command/reply exchange.
    pub timeout: Duration,
    /// Bound on waiting for the next stream packet.
    pub stream_timeout: Duration,
    pub line_ending: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            stream_timeout: Duration::from_secs(2),
            line_ending: "\n".into(),
        }
    }
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_line_ending(mut self, line_ending: impl Into<String>) -> Self {
        self.line_ending = line_ending.into();
        self
    }
}
