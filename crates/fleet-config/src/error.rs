//! Error types for configuration transactions.
//!
//! Callers map these to user-facing outcomes, so lock conflicts, missing
//! targets, and data-integrity problems each get their own variant.

use fleet_agentcomm::AgentCommError;
use fleet_core::{ContextId, DaemonId, HostId};
use fleet_store::StoreError;
use thiserror::Error;

/// A result type using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while staging or committing configuration changes.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The staged object is not associated with any daemon.
    #[error("{operation}: host {host_id} is not associated with any daemon")]
    NoDaemons {
        /// The staging operation.
        operation: &'static str,
        /// The host being staged.
        host_id: HostId,
    },

    /// A daemon association was not loaded with its daemon.
    #[error("host is associated with daemon {daemon_id} which was not loaded")]
    MissingDaemon {
        /// The daemon referenced by the association.
        daemon_id: DaemonId,
    },

    /// A daemon has no owning application.
    #[error("daemon {daemon_id} is not associated with an app")]
    MissingApp {
        /// The daemon without an app.
        daemon_id: DaemonId,
    },

    /// A host reservation has no identifier to address it by.
    #[error("host {0} has no identifiers")]
    MissingIdentifier(HostId),

    /// The host does not exist.
    #[error("host not found: {0}")]
    HostNotFound(HostId),

    /// The daemon is locked by another transaction.
    #[error("daemon {daemon_id} is locked by configuration context {holder}")]
    Locked {
        /// The contended daemon.
        daemon_id: DaemonId,
        /// The context holding the lock.
        holder: ContextId,
    },

    /// The context was reclaimed or never existed.
    #[error("configuration context {0} has expired")]
    Expired(ContextId),

    /// An apply step was called without the matching begin step.
    #[error("no pending {operation} update in the context")]
    NoPendingUpdate {
        /// The operation that needs a begin step.
        operation: &'static str,
    },

    /// No configuration module is registered under this name.
    #[error("unknown configuration module: {0}")]
    UnknownModule(String),

    /// The module does not implement this operation.
    #[error("unknown operation {operation} for module {module}")]
    UnknownOperation {
        /// The module name.
        module: String,
        /// The operation name.
        operation: String,
    },

    /// Committing a staged update failed; later updates were not attempted.
    #[error("commit of update {index} ({operation}) failed: {source}")]
    CommitFailed {
        /// Position of the failed update in staging order.
        index: usize,
        /// Operation of the failed update.
        operation: String,
        /// Why it failed.
        source: Box<ConfigError>,
    },

    /// The commit was cancelled before this update started.
    #[error("commit cancelled before update {index}")]
    Cancelled {
        /// Position of the first update not attempted.
        index: usize,
    },

    /// A daemon rejected a command.
    #[error("daemon {daemon} rejected {command}: {text}")]
    DaemonError {
        /// Daemon name.
        daemon: String,
        /// The rejected command.
        command: String,
        /// Error text returned by the daemon.
        text: String,
    },

    /// The command could not be delivered.
    #[error(transparent)]
    Forward(#[from] AgentCommError),

    /// A stored address is not a valid endpoint.
    #[error("invalid address: {0}")]
    Address(#[from] fleet_core::CoreError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A context could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ConfigError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::HostNotFound(_) | Self::Expired(_) => 404,
            Self::Locked { .. } => 423,
            Self::Cancelled { .. } => 409,
            Self::NoDaemons { .. }
            | Self::MissingDaemon { .. }
            | Self::MissingApp { .. }
            | Self::MissingIdentifier(_)
            | Self::NoPendingUpdate { .. } => 400,
            Self::Forward(_) | Self::DaemonError { .. } => 502,
            Self::CommitFailed { source, .. } => source.http_status_code(),
            Self::UnknownModule(_)
            | Self::UnknownOperation { .. }
            | Self::Address(_)
            | Self::Store(_)
            | Self::Serialization(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Locked { .. } | Self::Cancelled { .. } | Self::Store(_) => true,
            Self::Forward(e) => e.is_retriable(),
            Self::CommitFailed { source, .. } => source.is_retriable(),
            _ => false,
        }
    }
}
