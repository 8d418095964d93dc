//! Daemon command envelope and target addressing.
//!
//! Commands are opaque to this layer apart from their name and target
//! services. A daemon answers a command with one response per service.

use fleet_core::AgentEndpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command addressed to one or more daemons of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonCommand {
    /// Command name (e.g. `reservation-add`).
    pub command: String,
    /// Daemon names the command targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<String>,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl DaemonCommand {
    /// Create a command.
    #[must_use]
    pub fn new(command: impl Into<String>, service: Vec<String>, arguments: Option<Value>) -> Self {
        Self {
            command: command.into(),
            service,
            arguments,
        }
    }
}

/// One daemon's answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Result code; zero means success.
    pub result: i64,
    /// Human-readable status text.
    #[serde(default)]
    pub text: Option<String>,
    /// Result arguments.
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl DaemonResponse {
    /// Whether the daemon reported an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.result != 0
    }
}

/// Return the first daemon-reported error in a list of responses.
#[must_use]
pub fn first_error(responses: &[DaemonResponse]) -> Option<&DaemonResponse> {
    responses.iter().find(|r| r.is_error())
}

/// Serializable reference to a daemon, independent of any database handle.
///
/// This is everything needed to deliver a command: the agent to go through,
/// the application's control channel the agent relays to, and the daemon
/// name to put in the command's `service` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlledDaemon {
    /// Endpoint of the agent on the daemon's machine.
    pub machine: AgentEndpoint,
    /// Daemon name within its application.
    pub daemon_name: String,
    /// Control channel of the owning application.
    pub control: AgentEndpoint,
    /// Whether the control channel uses TLS.
    #[serde(default)]
    pub control_secure: bool,
}

impl ControlledDaemon {
    /// URL the agent relays the command to.
    #[must_use]
    pub fn control_url(&self) -> String {
        self.control.url(self.control_secure)
    }
}
