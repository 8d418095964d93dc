//! Agent endpoint addressing.
//!
//! An agent is reached at a `host:port` pair where the host is either an IP
//! literal or a DNS name. IPv6 literals use the bracketed form `[::1]:8080`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The network address of an agent.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentEndpoint {
    host: String,
    port: u16,
}

impl AgentEndpoint {
    /// Create an endpoint from its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty or contains whitespace.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, CoreError> {
        let host = host.into();
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() {
            return Err(CoreError::InvalidEndpoint {
                input: host,
                reason: "empty host",
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidEndpoint {
                input: host,
                reason: "host contains whitespace",
            });
        }
        Ok(Self {
            host: trimmed.to_string(),
            port,
        })
    }

    /// The host part, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The host parsed as an IP literal, if it is one.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the host is an IP literal rather than a DNS name.
    #[must_use]
    pub fn is_ip(&self) -> bool {
        self.ip().is_some()
    }

    /// Build an URL rooted at this endpoint.
    #[must_use]
    pub fn url(&self, secure: bool) -> String {
        let scheme = if secure { "https" } else { "http" };
        format!("{scheme}://{self}/")
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentEndpoint({self})")
    }
}

impl FromStr for AgentEndpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| CoreError::InvalidEndpoint {
            input: s.to_string(),
            reason,
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        // A bare IPv6 literal without brackets is ambiguous.
        if host.contains(':') && !host.starts_with('[') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }

        Self::new(host, port)
    }
}

impl TryFrom<String> for AgentEndpoint {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentEndpoint> for String {
    fn from(endpoint: AgentEndpoint) -> Self {
        endpoint.to_string()
    }
}
