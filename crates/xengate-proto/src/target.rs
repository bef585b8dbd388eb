//! Forwarding destinations

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetAddrError {
    #[error("Missing port in target address: {0}")]
    MissingPort(String),

    #[error("Invalid port in target address: {0}")]
    InvalidPort(String),

    #[error("Empty host in target address: {0}")]
    EmptyHost(String),
}

/// Host and port a forward is opened against.
///
/// The host is kept unbracketed; [`fmt::Display`] adds brackets back for
/// IPv6 literals so the output is always a valid `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse `host[:port]`, falling back to `default_port` when absent
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, TargetAddrError> {
        match s.parse::<Self>() {
            Err(TargetAddrError::MissingPort(_)) => {
                let host = s.trim();
                if host.is_empty() {
                    return Err(TargetAddrError::EmptyHost(s.to_string()));
                }
                Ok(Self::new(host, default_port))
            }
            other => other,
        }
    }
}

impl FromStr for TargetAddr {
    type Err = TargetAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| TargetAddrError::MissingPort(s.to_string()))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| TargetAddrError::MissingPort(s.to_string()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| TargetAddrError::InvalidPort(s.to_string()))?;
            if host.is_empty() {
                return Err(TargetAddrError::EmptyHost(s.to_string()));
            }
            return Ok(Self::new(host, port));
        }

        // A bare IPv6 literal has no port
        if s.parse::<IpAddr>().map(|ip| ip.is_ipv6()).unwrap_or(false) {
            return Err(TargetAddrError::MissingPort(s.to_string()));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TargetAddrError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(TargetAddrError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TargetAddrError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname() {
        let target: TargetAddr = "example.com:443".parse().unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
        assert_eq!(target.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let target: TargetAddr = "[2001:db8::1]:8080".parse().unwrap();
        assert_eq!(target.host(), "2001:db8::1");
        assert_eq!(target.port(), 8080);
        assert_eq!(target.to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn test_parse_rejects_missing_or_bad_port() {
        assert_eq!(
            "example.com".parse::<TargetAddr>(),
            Err(TargetAddrError::MissingPort("example.com".to_string()))
        );
        assert!(matches!(
            "example.com:http".parse::<TargetAddr>(),
            Err(TargetAddrError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<TargetAddr>(),
            Err(TargetAddrError::EmptyHost(_))
        ));
        assert!(matches!(
            "::1".parse::<TargetAddr>(),
            Err(TargetAddrError::MissingPort(_))
        ));
    }

    #[test]
    fn test_default_port() {
        let target = TargetAddr::parse_with_default_port("example.com", 443).unwrap();
        assert_eq!(target.to_string(), "example.com:443");

        let explicit = TargetAddr::parse_with_default_port("example.com:8443", 443).unwrap();
        assert_eq!(explicit.port(), 8443);
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "[::1]:22".parse().unwrap();
        assert_eq!(TargetAddr::from(addr).to_string(), "[::1]:22");
    }
}
