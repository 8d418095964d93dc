//! Abstract RPC surface of an agent.
//!
//! The forwarder and registry depend only on these traits; the wire
//! framing lives in the implementations (see [`crate::http`]).

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::AgentEndpoint;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// An application discovered on the agent's machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAccessPoint {
    /// Application family (e.g. `kea`, `bind9`).
    pub kind: String,
    /// Control channel address.
    pub address: String,
    /// Control channel port.
    pub port: u16,
    /// Whether the control channel uses TLS.
    #[serde(default)]
    pub use_secure_protocol: bool,
}

/// Snapshot of a machine as reported by its agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    /// Agent software version.
    pub agent_version: String,
    /// Machine hostname.
    pub hostname: String,
    /// Applications found on the machine.
    #[serde(default)]
    pub apps: Vec<AppAccessPoint>,
}

/// An established, authenticated channel to one agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Fetch the machine state.
    ///
    /// # Errors
    ///
    /// Returns an `RpcError` describing the failed attempt.
    async fn get_state(&self) -> Result<MachineState, RpcError>;

    /// Relay an encoded command to the daemon control channel at `daemon_url`
    /// and return the daemon's encoded answer.
    ///
    /// # Errors
    ///
    /// Returns an `RpcError` describing the failed attempt.
    async fn forward_command(&self, daemon_url: &str, request: &str) -> Result<String, RpcError>;

    /// Read lines of a file on the agent's machine starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an `RpcError` describing the failed attempt.
    async fn tail_file(&self, path: &str, offset: u64) -> Result<Vec<String>, RpcError>;
}

/// Establishes channels to agents.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Open a new channel to the agent at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an `RpcError` if the channel cannot be set up.
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Arc<dyn AgentClient>, RpcError>;
}
