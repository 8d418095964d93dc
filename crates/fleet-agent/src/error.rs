//! Error types for agent onboarding.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A result type using `AgentError`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The registration step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    /// Parsing the controller URL.
    ParseUrl,
    /// Loading or generating the key and CSR.
    Identity,
    /// Persisting the agent token.
    StoreToken,
    /// Posting the registration request.
    Register,
    /// Checking and persisting the returned certificates.
    StoreCertificates,
    /// Confirming the registration with a ping.
    Ping,
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParseUrl => "parse controller URL",
            Self::Identity => "prepare identity",
            Self::StoreToken => "store agent token",
            Self::Register => "register machine",
            Self::StoreCertificates => "store certificates",
            Self::Ping => "ping machine",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while provisioning or using the agent identity.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A file could not be read or written.
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A private key could not be generated or parsed.
    #[error("key error: {0}")]
    Key(String),

    /// A certificate or CSR is invalid.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS files are present but unusable.
    #[error("TLS is not usable: {0}")]
    Tls(String),

    /// The credentials file is unreadable or malformed.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// An HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A registration step failed.
    #[error("registration failed to {step}: {reason}")]
    Registration {
        /// The failed step.
        step: RegistrationStep,
        /// Why it failed.
        reason: String,
    },
}

impl AgentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn registration(step: RegistrationStep, reason: impl fmt::Display) -> Self {
        Self::Registration {
            step,
            reason: reason.to_string(),
        }
    }

    /// The registration step, for registration failures.
    #[must_use]
    pub const fn step(&self) -> Option<RegistrationStep> {
        match self {
            Self::Registration { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_message_names_step() {
        let err = AgentError::registration(RegistrationStep::Ping, "status 503");
        assert_eq!(err.to_string(), "registration failed to ping machine: status 503");
        assert_eq!(err.step(), Some(RegistrationStep::Ping));
    }

    #[test]
    fn io_message_names_file() {
        let err = AgentError::io(
            "/var/lib/fleet-agent/certs/key.pem",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/var/lib/fleet-agent/certs/key.pem"));
        assert_eq!(err.step(), None);
    }
}
