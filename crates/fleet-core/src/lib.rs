//! Core types and utilities for the fleet control plane.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identifiers**: Strongly-typed numeric IDs for users, machines, apps,
//!   daemons, hosts and configuration contexts
//! - **Endpoints**: The `host:port` address of an agent
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use fleet_core::{AgentEndpoint, DaemonId};
//!
//! let endpoint: AgentEndpoint = "10.0.0.5:8080".parse().unwrap();
//! assert!(endpoint.is_ip());
//!
//! let daemon_id = DaemonId::new(42);
//! assert_eq!(daemon_id.to_string(), "42");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod endpoint;
pub mod error;
pub mod ids;

pub use endpoint::AgentEndpoint;
pub use error::{CoreError, Result};
pub use ids::{AppId, ContextId, DaemonId, HostId, IdError, MachineId, UserId};
