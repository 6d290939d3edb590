//! Network endpoints (`host:port`).

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// An immutable `host:port` pair.
///
/// Used both for discovery agents and for the store nodes they report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A usable address has a non-empty host and a non-zero port.
    pub fn is_routable(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("missing port in endpoint `{0}`")]
    MissingPort(String),
    #[error("empty host in endpoint `{0}`")]
    EmptyHost(String),
    #[error("invalid port in endpoint `{0}`")]
    InvalidPort(String),
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| EndpointParseError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl Endpoint {
    /// Parse a comma-separated list such as `"10.0.0.1:26379,10.0.0.2:26379"`.
    pub fn parse_list(s: &str) -> Result<Vec<Endpoint>, EndpointParseError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Endpoint::from_str)
            .collect()
    }
}
