//! Bind targets for acceptors.

use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// An `ip:port` pair one acceptor listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct EndPoint {
    pub ip: String,
    pub port: u16,
}

impl EndPoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Resolve to a socket address. Only literal IP addresses are accepted.
    pub fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        let ip = self
            .ip
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid ip address '{}': {e}", self.ip),
                )
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for EndPoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Parse failure for `"ip:port"` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEndPointError(String);

impl fmt::Display for ParseEndPointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint '{}', expected ip:port", self.0)
    }
}

impl std::error::Error for ParseEndPointError {}

impl FromStr for EndPoint {
    type Err = ParseEndPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        s.parse::<SocketAddr>()
            .map(EndPoint::from)
            .map_err(|_| ParseEndPointError(s.to_string()))
    }
}

impl TryFrom<String> for EndPoint {
    type Error = ParseEndPointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4() {
        let ep: EndPoint = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(ep, EndPoint::new("127.0.0.1", 8080));
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_v6() {
        let ep: EndPoint = "[::1]:9000".parse().unwrap();
        assert_eq!(ep.ip, "::1");
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.to_string(), "[::1]:9000");
        assert_eq!(ep.to_socket_addr().unwrap(), "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("localhost".parse::<EndPoint>().is_err());
        assert!("1.2.3.4:99999".parse::<EndPoint>().is_err());
    }

    #[test]
    fn test_invalid_ip_resolution() {
        let ep = EndPoint::new("not-an-ip", 80);
        let err = ep.to_socket_addr().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
