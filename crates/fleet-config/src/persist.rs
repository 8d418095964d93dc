//! Remembered contexts.
//!
//! A context can be set aside between requests and picked up later by the
//! same user. [`MemoryContextStore`] keeps the context as staged, with live
//! targets. [`PersistentContextStore`] writes a snapshot through the
//! database so it survives restarts; what comes back is marked `scheduled`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::ContextId;
use fleet_store::{ContextRecord, Store};
use parking_lot::Mutex;

use crate::error::{ConfigError, Result};
use crate::types::ConfigContext;

/// A remembered context and when it stops being recoverable.
#[derive(Debug, Clone)]
pub struct StoredContext {
    /// The context.
    pub context: ConfigContext,
    /// Expiry of the remembered copy.
    pub expires_at: DateTime<Utc>,
}

/// Storage for remembered contexts.
pub trait ContextStore: Send + Sync {
    /// Remember `ctx` until `expires_at`, replacing an earlier copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be encoded or stored.
    fn save(&self, ctx: &ConfigContext, expires_at: DateTime<Utc>) -> Result<()>;

    /// Load a remembered context.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored copy cannot be read or decoded.
    fn load(&self, id: ContextId) -> Result<Option<StoredContext>>;

    /// Forget a context. Forgetting a missing context is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn remove(&self, id: ContextId) -> Result<()>;

    /// IDs of remembered contexts expired at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ContextId>>;
}

/// In-process context storage.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    contexts: Mutex<HashMap<ContextId, StoredContext>>,
}

impl MemoryContextStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStore for MemoryContextStore {
    fn save(&self, ctx: &ConfigContext, expires_at: DateTime<Utc>) -> Result<()> {
        self.contexts.lock().insert(
            ctx.id,
            StoredContext {
                context: ctx.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    fn load(&self, id: ContextId) -> Result<Option<StoredContext>> {
        Ok(self.contexts.lock().get(&id).cloned())
    }

    fn remove(&self, id: ContextId) -> Result<()> {
        self.contexts.lock().remove(&id);
        Ok(())
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ContextId>> {
        Ok(self
            .contexts
            .lock()
            .iter()
            .filter(|(_, stored)| stored.expires_at <= now)
            .map(|(id, _)| *id)
            .collect())
    }
}

/// Context storage backed by the database.
pub struct PersistentContextStore<S: Store> {
    store: Arc<S>,
}

impl<S: Store> PersistentContextStore<S> {
    /// Create a store writing through `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn encode(ctx: &ConfigContext) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(ctx, &mut buf).map_err(|e| ConfigError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode(bytes: &[u8]) -> Result<ConfigContext> {
    ciborium::from_reader(bytes).map_err(|e| ConfigError::Serialization(e.to_string()))
}

impl<S: Store> ContextStore for PersistentContextStore<S> {
    fn save(&self, ctx: &ConfigContext, expires_at: DateTime<Utc>) -> Result<()> {
        let snapshot = ctx.to_snapshot()?;
        let record = ContextRecord {
            context_id: ctx.id,
            user_id: ctx.user_id,
            expires_at,
            payload: encode(&snapshot)?,
        };
        self.store.put_context(&record)?;
        Ok(())
    }

    fn load(&self, id: ContextId) -> Result<Option<StoredContext>> {
        let Some(record) = self.store.get_context(id)? else {
            return Ok(None);
        };
        let mut context = decode(&record.payload)?;
        context.state.scheduled = true;
        Ok(Some(StoredContext {
            context,
            expires_at: record.expires_at,
        }))
    }

    fn remove(&self, id: ContextId) -> Result<()> {
        self.store.delete_context(id)?;
        Ok(())
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ContextId>> {
        Ok(self.store.list_expired_contexts(now)?)
    }
}
