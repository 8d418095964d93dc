//! `RocksDB` storage layer for the fleet control plane.
//!
//! This crate provides the domain model snapshot types and persistent
//! storage for host reservations and remembered configuration contexts
//! using `RocksDB` with column families.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `hosts`: Host reservation records, keyed by `host_id`
//! - `contexts`: Remembered transaction contexts, keyed by `context_id`
//! - `contexts_by_expiry`: Index for reclaiming expired contexts
//!
//! # Example
//!
//! ```no_run
//! use fleet_store::{RocksStore, Store};
//! use fleet_core::HostId;
//!
//! let store = RocksStore::open("/tmp/fleet-db").unwrap();
//! let host = store.get_host(HostId::new(1)).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{App, ContextRecord, Daemon, Host, HostIdentifier, LocalHost, Machine};

use chrono::{DateTime, Utc};
use fleet_core::{ContextId, HostId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Host Operations
    // =========================================================================

    /// Insert or update a host reservation, including its daemon associations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_host(&self, host: &Host) -> Result<()>;

    /// Get a host reservation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_host(&self, host_id: HostId) -> Result<Option<Host>>;

    // =========================================================================
    // Context Operations
    // =========================================================================

    /// Insert or replace a remembered context.
    ///
    /// This also maintains the expiry index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_context(&self, record: &ContextRecord) -> Result<()>;

    /// Get a remembered context by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_context(&self, context_id: ContextId) -> Result<Option<ContextRecord>>;

    /// Delete a remembered context. Deleting a missing context is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_context(&self, context_id: ContextId) -> Result<()>;

    /// List the IDs of contexts whose expiry is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_expired_contexts(&self, now: DateTime<Utc>) -> Result<Vec<ContextId>>;
}
