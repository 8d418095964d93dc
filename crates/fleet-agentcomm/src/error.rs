//! Error types for agent communication.
//!
//! Failures fall into two families. Transport failures (refused, reset,
//! timed out) may succeed on a fresh connection and are retried once by the
//! forwarder. Protocol failures (an answer that cannot be understood) are
//! returned immediately.

use std::time::Duration;

use fleet_core::AgentEndpoint;
use thiserror::Error;

/// A result type using `AgentCommError`.
pub type Result<T> = std::result::Result<T, AgentCommError>;

/// Error reported by a single RPC attempt.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The request did not reach the agent or the connection broke.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The attempt did not finish within the per-RPC timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The agent answered with something that could not be understood.
    #[error("protocol failure: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Whether a fresh connection might make the call succeed.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Errors surfaced to callers of the registry and the forwarder.
#[derive(Debug, Error)]
pub enum AgentCommError {
    /// The endpoint was never registered with the connection registry.
    #[error("no such agent: {0}")]
    NoSuchAgent(AgentEndpoint),

    /// A connection to the agent could not be established.
    #[error("problem with connection to agent {endpoint}: {reason}")]
    Connect {
        /// The agent endpoint.
        endpoint: AgentEndpoint,
        /// Why the connection failed.
        reason: String,
    },

    /// The RPC failed on the transport, possibly after one reconnect.
    #[error(
        "failed to forward {command} to agent {endpoint}{}: {source}",
        retry_note(.retried)
    )]
    Transport {
        /// The agent endpoint.
        endpoint: AgentEndpoint,
        /// The command being forwarded.
        command: String,
        /// Whether the reconnect-and-retry cycle was attempted.
        retried: bool,
        /// The last attempt's failure.
        source: RpcError,
    },

    /// The agent's answer could not be understood; never retried.
    #[error("invalid response from agent {endpoint} to {command}: {reason}")]
    Protocol {
        /// The agent endpoint.
        endpoint: AgentEndpoint,
        /// The command being forwarded.
        command: String,
        /// What was wrong with the answer.
        reason: String,
    },

    /// A command could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn retry_note(retried: &bool) -> &'static str {
    if *retried {
        " after reconnecting and retrying once"
    } else {
        ""
    }
}

impl AgentCommError {
    /// Returns true if this error might be resolved by retrying later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Transport { .. })
    }
}
