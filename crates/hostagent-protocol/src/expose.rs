//! Port exposure grammar: `PROTOCOL:PORT` or `PROTOCOL:LOW-HIGH`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ExposeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(ExposeParseError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A single `(protocol, port)` pair requested to be reachable on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expose {
    pub protocol: Protocol,
    pub port: u16,
}

impl Expose {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

impl fmt::Display for Expose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.protocol, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExposeParseError {
    #[error("could not parse expose {0:?}, expected PROTOCOL:PORT or PROTOCOL:LOW-HIGH")]
    Malformed(String),

    #[error("unknown protocol {0:?}, expected TCP or UDP")]
    UnknownProtocol(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid port range {low}-{high}, the low port must be below the high port")]
    InvalidRange { low: u16, high: u16 },
}

fn parse_port(raw: &str) -> Result<u16, ExposeParseError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ExposeParseError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Parse one expose token. A range expands to one entry per port, inclusive.
pub fn parse_expose(token: &str) -> Result<Vec<Expose>, ExposeParseError> {
    let (protocol, ports) = token
        .split_once(':')
        .ok_or_else(|| ExposeParseError::Malformed(token.to_string()))?;
    let protocol: Protocol = protocol.parse()?;

    match ports.split_once('-') {
        None => Ok(vec![Expose::new(protocol, parse_port(ports)?)]),
        Some((low, high)) => {
            let low = parse_port(low)?;
            let high = parse_port(high)?;
            if low >= high {
                return Err(ExposeParseError::InvalidRange { low, high });
            }
            Ok((low..=high).map(|port| Expose::new(protocol, port)).collect())
        }
    }
}

/// Parse a list of expose tokens, flattening ranges.
pub fn parse_exposes<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Expose>, ExposeParseError> {
    let mut exposes = Vec::new();
    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() {
            continue;
        }
        exposes.extend(parse_expose(token)?);
    }
    Ok(exposes)
}
