//! Basic auth credentials for daemon control channels.
//!
//! The credentials file lists one entry per control channel endpoint:
//!
//! ```json
//! { "basic_auth": [ { "ip": "127.0.0.1", "port": 8000, "user": "kea", "password": "secret" } ] }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::identity::write_restricted;

/// A user name and password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    basic_auth: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    ip: String,
    port: u16,
    user: String,
    password: String,
}

/// Credentials keyed by control channel host and port.
#[derive(Debug, Default, Clone)]
pub struct CredentialsStore {
    entries: HashMap<(String, u16), BasicAuth>,
}

impl CredentialsStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load credentials from `path`.
    ///
    /// A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Self::parse(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No credentials file");
                Ok(Self::new())
            }
            Err(e) => Err(AgentError::io(path, e)),
        }
    }

    /// Parse the JSON credentials format.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Credentials` on malformed input.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_slice(bytes)
            .map_err(|e| AgentError::Credentials(format!("malformed credentials file: {e}")))?;

        let mut store = Self::new();
        for entry in file.basic_auth {
            store.add(
                &entry.ip,
                entry.port,
                BasicAuth {
                    user: entry.user,
                    password: entry.password,
                },
            );
        }
        Ok(store)
    }

    /// Add or replace the credentials for `host:port`.
    pub fn add(&mut self, host: &str, port: u16, auth: BasicAuth) {
        self.entries.insert((normalize_host(host), port), auth);
    }

    /// Credentials for `host:port`.
    #[must_use]
    pub fn get(&self, host: &str, port: u16) -> Option<&BasicAuth> {
        self.entries.get(&(normalize_host(host), port))
    }

    /// Credentials for the host and port of `url`.
    ///
    /// The scheme's default port is used when the URL names none.
    #[must_use]
    pub fn get_by_url(&self, url: &reqwest::Url) -> Option<&BasicAuth> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        self.get(host, port)
    }

    /// Whether the store holds no credentials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of credential entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Write the store to `path`, readable by the owner only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut basic_auth: Vec<Entry> = self
            .entries
            .iter()
            .map(|((host, port), auth)| Entry {
                ip: host.clone(),
                port: *port,
                user: auth.user.clone(),
                password: auth.password.clone(),
            })
            .collect();
        basic_auth.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));

        let json = serde_json::to_vec_pretty(&CredentialsFile { basic_auth })
            .map_err(|e| AgentError::Credentials(e.to_string()))?;
        write_restricted(path, &json)
    }
}

fn normalize_host(host: &str) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => bare.to_ascii_lowercase(),
    }
}
