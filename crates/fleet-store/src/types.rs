//! Domain types stored in the database.
//!
//! These types mirror the rows the control plane reads when staging a
//! configuration change: the machine an agent runs on, the application that
//! owns a daemon, the daemon itself, and the host reservations assigned to
//! daemons. Associations are optional because they are loaded lazily; code
//! that needs one must treat its absence as a data-integrity error.

use chrono::{DateTime, Utc};
use fleet_core::{AgentEndpoint, AppId, ContextId, DaemonId, HostId, MachineId, UserId};
use serde::{Deserialize, Serialize};

/// A machine running an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine identifier.
    pub id: MachineId,
    /// Address the agent listens on.
    pub address: String,
    /// Port the agent listens on.
    pub agent_port: u16,
}

impl Machine {
    /// The agent endpoint of this machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored address is not a valid host.
    pub fn endpoint(&self) -> fleet_core::Result<AgentEndpoint> {
        AgentEndpoint::new(self.address.clone(), self.agent_port)
    }
}

/// An application (one daemon family installation) on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Application identifier.
    pub id: AppId,
    /// The machine the application runs on.
    pub machine: Machine,
    /// Address of the application's control channel.
    pub control_address: String,
    /// Port of the application's control channel.
    pub control_port: u16,
    /// Whether the control channel uses TLS.
    #[serde(default)]
    pub use_secure_protocol: bool,
}

impl App {
    /// The control endpoint of this application.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored address is not a valid host.
    pub fn control_endpoint(&self) -> fleet_core::Result<AgentEndpoint> {
        AgentEndpoint::new(self.control_address.clone(), self.control_port)
    }
}

/// A managed daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Daemon {
    /// Daemon identifier.
    pub id: DaemonId,
    /// Daemon name as known to its application (e.g. `dhcp4`).
    pub name: String,
    /// Owning application, when loaded.
    #[serde(default)]
    pub app: Option<App>,
}

/// The association of a host reservation with one daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHost {
    /// The daemon holding the reservation.
    pub daemon_id: DaemonId,
    /// The daemon, when loaded.
    #[serde(default)]
    pub daemon: Option<Daemon>,
}

/// A client identifier used to match a host reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentifier {
    /// Identifier type (`hw-address`, `duid`, `client-id`, `circuit-id`, `flex-id`).
    pub kind: String,
    /// Identifier value as colon-separated hex.
    pub value: String,
}

/// A host reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Host identifier.
    pub id: HostId,
    /// Subnet the reservation belongs to; `None` for global reservations.
    #[serde(default)]
    pub subnet_id: Option<i64>,
    /// Reserved hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Identifiers used to match the client.
    pub identifiers: Vec<HostIdentifier>,
    /// Reserved IP addresses.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// Reserved delegated prefixes.
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Daemons the reservation is configured in.
    #[serde(default)]
    pub local_hosts: Vec<LocalHost>,
}

impl Host {
    /// IDs of all daemons this host is associated with, in order.
    #[must_use]
    pub fn daemon_ids(&self) -> Vec<DaemonId> {
        self.local_hosts.iter().map(|lh| lh.daemon_id).collect()
    }
}

/// A remembered configuration context.
///
/// The payload is opaque to the store; the transaction manager owns its
/// encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Context identifier.
    pub context_id: ContextId,
    /// The user who owns the context.
    pub user_id: UserId,
    /// When the record stops being recoverable.
    pub expires_at: DateTime<Utc>,
    /// Encoded context.
    pub payload: Vec<u8>,
}

impl ContextRecord {
    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
