//! Agent communication for the fleet control plane.
//!
//! The control plane never talks to a DHCP or DNS daemon directly. Every
//! command goes through the agent running on the daemon's machine, which
//! relays it to the daemon's control channel. This crate keeps one
//! connection per agent and delivers commands over it, replacing a broken
//! connection at most once per call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  forward_command  ┌──────────────────────┐
//! │ CommandForwarder│──────────────────▶│  ConnectionRegistry  │
//! │  (1 retry max)  │◀──────────────────│ endpoint → Connection│
//! └────────┬────────┘    Connection     └──────────┬───────────┘
//!          │                                       │ connect / reconnect
//!          │ AgentClient::forward_command          ▼
//!          │                            ┌──────────────────────┐
//!          └───────────────────────────▶│   AgentConnector     │
//!                                       │  (HttpAgentConnector)│
//!                                       └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleet_agentcomm::{
//!     CommandForwarder, ConnectionRegistry, DaemonCommand, ForwarderConfig,
//!     HttpAgentConnector,
//! };
//!
//! let registry = Arc::new(ConnectionRegistry::new(Arc::new(HttpAgentConnector::default())));
//! registry.register_endpoint("192.0.2.1:8080".parse()?);
//!
//! let forwarder = CommandForwarder::new(registry, hooks, ForwarderConfig::default());
//! let responses = forwarder
//!     .forward_command(&daemon, &DaemonCommand::new("config-get", vec!["dhcp4".into()], None))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod error;
pub mod forwarder;
pub mod http;
pub mod registry;
pub mod transport;

pub use command::{first_error, ControlledDaemon, DaemonCommand, DaemonResponse};
pub use error::{AgentCommError, Result, RpcError};
pub use forwarder::{CommandForwarder, ForwarderConfig};
pub use http::{ClientTls, HttpAgentClient, HttpAgentConfig, HttpAgentConnector};
pub use registry::{Connection, ConnectionRegistry};
pub use transport::{AgentClient, AgentConnector, AppAccessPoint, MachineState};

#[cfg(any(test, feature = "test-utils"))]
pub use registry::testing::ScriptedConnector;
