//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Host reservation records, keyed by `host_id`.
    pub const HOSTS: &str = "hosts";

    /// Remembered configuration contexts, keyed by `context_id`.
    pub const CONTEXTS: &str = "contexts";

    /// Index: contexts by expiry, keyed by `expires_at || context_id`.
    pub const CONTEXTS_BY_EXPIRY: &str = "contexts_by_expiry";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::HOSTS, cf::CONTEXTS, cf::CONTEXTS_BY_EXPIRY]
}
