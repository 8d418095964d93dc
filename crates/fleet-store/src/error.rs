//! Error types for the storage layer.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`Store`](crate::Store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened, read, or written.
    #[error("database error: {0}")]
    Database(String),

    /// A record could not be encoded for writing.
    #[error("cannot encode record for {column_family}: {reason}")]
    Encode {
        /// Column family the record was meant for.
        column_family: &'static str,
        /// Encoder message.
        reason: String,
    },

    /// A stored record does not decode.
    #[error("corrupt record in {column_family} at key {key:02x?}: {reason}")]
    Corrupt {
        /// Column family holding the record.
        column_family: &'static str,
        /// Raw key of the record.
        key: Vec<u8>,
        /// Decoder message.
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the operation could succeed.
    ///
    /// Encoding and decoding failures are deterministic.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
