//! Host/port addresses for statically configured desktops
//!
//! Accepts `host`, `host:port`, `[v6addr]:port` and bare IPv6 literals.
//! A missing port falls back to the supplied default (normally the RDP port).

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetAddrError {
    #[error("Empty address")]
    Empty,

    #[error("Invalid port in address: {0}")]
    InvalidPort(String),

    #[error("Invalid address: {0}")]
    Invalid(String),
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    pub host: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an address, using `default_port` when none is given
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, NetAddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetAddrError::Empty);
        }

        // [v6]:port or [v6]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| NetAddrError::Invalid(s.to_string()))?;
            Ipv6Addr::from_str(host).map_err(|_| NetAddrError::Invalid(s.to_string()))?;
            let port = match after {
                "" => default_port,
                p => p
                    .strip_prefix(':')
                    .ok_or_else(|| NetAddrError::Invalid(s.to_string()))?
                    .parse::<u16>()
                    .map_err(|_| NetAddrError::InvalidPort(s.to_string()))?,
            };
            return Ok(Self::new(host, port));
        }

        // Bare IPv6 literal, no port
        if Ipv6Addr::from_str(s).is_ok() {
            return Ok(Self::new(s, default_port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(NetAddrError::Invalid(s.to_string()));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| NetAddrError::InvalidPort(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, default_port)),
        }
    }
}

impl std::fmt::Display for NetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NetAddr {
    type Err = NetAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default_port(s, crate::RDP_PORT)
    }
}
