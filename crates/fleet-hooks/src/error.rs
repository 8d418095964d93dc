//! Error types for hook management.

use thiserror::Error;

/// A result type using `HookError`.
pub type Result<T> = std::result::Result<T, HookError>;

/// Errors that can occur while managing carriers.
#[derive(Debug, Error)]
pub enum HookError {
    /// A carrier failed to release its resources.
    #[error("carrier {carrier} failed to close: {reason}")]
    Close {
        /// Name of the carrier.
        carrier: String,
        /// Reason reported by the carrier.
        reason: String,
    },

    /// One or more carriers failed to close during shutdown.
    #[error("{} carrier(s) failed to close: {}", .0.len(), join(.0))]
    Shutdown(Vec<HookError>),
}

fn join(errors: &[HookError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
