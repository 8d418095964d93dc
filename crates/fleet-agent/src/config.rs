//! Agent file locations and registration settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Locations of the agent's identity and credential files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    /// Agent private key (PEM).
    pub key_pem: PathBuf,
    /// Agent certificate signed by the controller (PEM).
    pub cert_pem: PathBuf,
    /// Controller root CA certificate (PEM).
    pub root_ca_pem: PathBuf,
    /// Agent token used when no controller token is supplied.
    pub agent_token: PathBuf,
    /// Basic auth credentials for daemon control channels (JSON).
    pub credentials: PathBuf,
}

impl Default for AgentPaths {
    fn default() -> Self {
        let state = Path::new("/var/lib/fleet-agent");
        Self {
            key_pem: state.join("certs/key.pem"),
            cert_pem: state.join("certs/cert.pem"),
            root_ca_pem: state.join("certs/ca.pem"),
            agent_token: state.join("tokens/agent-token.txt"),
            credentials: PathBuf::from("/etc/fleet/agent-credentials.json"),
        }
    }
}

impl AgentPaths {
    /// All files directly under `dir`.
    #[must_use]
    pub fn under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            key_pem: dir.join("key.pem"),
            cert_pem: dir.join("cert.pem"),
            root_ca_pem: dir.join("ca.pem"),
            agent_token: dir.join("agent-token.txt"),
            credentials: dir.join("agent-credentials.json"),
        }
    }

    /// Identity files whose presence decides whether TLS is configured.
    #[must_use]
    pub fn tls_files(&self) -> [&Path; 3] {
        [&self.key_pem, &self.cert_pem, &self.root_ca_pem]
    }
}

/// Settings for registering with the controller.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Pause between attempts when the controller refuses connections.
    pub retry_interval: Duration,
    /// Number of ping attempts after registering with a controller token.
    pub ping_attempts: u32,
    /// Ping attempt `n` is followed by a pause of `n` units.
    pub ping_backoff_unit: Duration,
    /// Timeout of each HTTP request to the controller.
    pub request_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            ping_attempts: 3,
            ping_backoff_unit: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}
