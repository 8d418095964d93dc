//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::{ContextId, HostId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{ContextRecord, Host};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(column_family: &'static str, value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Encode {
            column_family,
            reason: e.to_string(),
        })?;
        Ok(buf)
    }

    /// Deserialize the CBOR value stored under `key`.
    fn deserialize<T: serde::de::DeserializeOwned>(
        column_family: &'static str,
        key: &[u8],
        data: &[u8],
    ) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| {
            tracing::error!(column_family, key = ?key, error = %e, "Corrupt record");
            StoreError::Corrupt {
                column_family,
                key: key.to_vec(),
                reason: e.to_string(),
            }
        })
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Host Operations
    // =========================================================================

    fn put_host(&self, host: &Host) -> Result<()> {
        let cf = self.cf(cf::HOSTS)?;
        let value = Self::serialize(cf::HOSTS, host)?;

        self.db
            .put_cf(&cf, keys::host_key(host.id), value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_host(&self, host_id: HostId) -> Result<Option<Host>> {
        let cf = self.cf(cf::HOSTS)?;
        let key = keys::host_key(host_id);

        self.db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(cf::HOSTS, &key, &data))
            .transpose()
    }

    // =========================================================================
    // Context Operations
    // =========================================================================

    fn put_context(&self, record: &ContextRecord) -> Result<()> {
        let cf_contexts = self.cf(cf::CONTEXTS)?;
        let cf_by_expiry = self.cf(cf::CONTEXTS_BY_EXPIRY)?;

        let context_key = keys::context_key(record.context_id);
        let value = Self::serialize(cf::CONTEXTS, record)?;

        // Remembering the same context again moves its expiry
        let old_expiry = self.get_context(record.context_id)?.map(|r| r.expires_at);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_contexts, &context_key, &value);
        if let Some(old) = old_expiry {
            batch.delete_cf(
                &cf_by_expiry,
                keys::expiry_context_key(old, record.context_id),
            );
        }
        batch.put_cf(
            &cf_by_expiry,
            keys::expiry_context_key(record.expires_at, record.context_id),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            context_id = %record.context_id,
            expires_at = %record.expires_at,
            "Stored configuration context"
        );
        Ok(())
    }

    fn get_context(&self, context_id: ContextId) -> Result<Option<ContextRecord>> {
        let cf = self.cf(cf::CONTEXTS)?;
        let key = keys::context_key(context_id);

        self.db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(cf::CONTEXTS, &key, &data))
            .transpose()
    }

    fn delete_context(&self, context_id: ContextId) -> Result<()> {
        let cf_contexts = self.cf(cf::CONTEXTS)?;
        let cf_by_expiry = self.cf(cf::CONTEXTS_BY_EXPIRY)?;

        let Some(record) = self.get_context(context_id)? else {
            return Ok(());
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_contexts, keys::context_key(context_id));
        batch.delete_cf(
            &cf_by_expiry,
            keys::expiry_context_key(record.expires_at, context_id),
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_expired_contexts(&self, now: DateTime<Utc>) -> Result<Vec<ContextId>> {
        let cf = self.cf(cf::CONTEXTS_BY_EXPIRY)?;
        let cutoff = keys::expiry_prefix(now);

        let mut expired = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Keys are ordered by expiry; stop at the first one still alive
            if key.get(..8).is_some_and(|prefix| prefix > &cutoff[..]) {
                break;
            }

            match keys::extract_context_id_from_expiry_key(&key) {
                Some(context_id) => expired.push(context_id),
                None => tracing::warn!(key_len = key.len(), "Skipping malformed expiry key"),
            }
        }

        Ok(expired)
    }
}
