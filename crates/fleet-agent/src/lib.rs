//! Agent onboarding for the fleet control plane.
//!
//! An agent proves its identity to the controller with a client certificate.
//! This crate creates the agent's key, gets it certified by registering with
//! the controller, and builds the HTTP client that uses the result.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐ ensure_identity ┌──────────────┐  key.pem
//! │ Registrar │────────────────▶│   identity   │─────────▶ disk (0600)
//! └─────┬─────┘                 └──────────────┘
//!       │ POST api/machines (CSR)        ▲ load_identity
//!       ▼                                │
//!   controller ── cert.pem, ca.pem ──▶ disk ──▶ HttpClient ──▶ call(url, json)
//!                                                   ▲
//!                            agent-credentials.json ┘ basic auth
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleet_agent::{AgentPaths, Registrar, RegistrationConfig};
//!
//! let registrar = Registrar::new(AgentPaths::default(), RegistrationConfig::default())?;
//! let registration = registrar
//!     .register("https://controller.example.org", None, &"192.0.2.1:8080".parse()?, false, false)
//!     .await?;
//! println!("registered as machine {}", registration.machine_id);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod identity;
pub mod register;

pub use config::{AgentPaths, RegistrationConfig};
pub use credentials::{BasicAuth, CredentialsStore};
pub use error::{AgentError, RegistrationStep, Result};
pub use http::{HttpClient, HttpClientConfig};
pub use identity::{ensure_identity, load_identity, CsrBundle, TlsIdentity};
pub use register::{Registrar, Registration};
