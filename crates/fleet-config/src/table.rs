//! Live contexts and per-daemon locks.
//!
//! Both live behind one mutex so that acquiring a set of locks, and
//! recording them in the context, happens as a single step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleet_core::{ContextId, DaemonId, UserId};
use parking_lot::Mutex;

use crate::error::{ConfigError, Result};
use crate::types::ConfigContext;

#[derive(Debug)]
struct LiveEntry {
    user_id: UserId,
    expires_at: DateTime<Utc>,
    committing: bool,
}

impl LiveEntry {
    fn new(user_id: UserId, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            expires_at,
            committing: false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<ContextId, LiveEntry>,
    locks: HashMap<DaemonId, ContextId>,
}

impl Inner {
    /// First lock in `daemon_ids` held by a context other than `id`.
    fn conflict(&self, id: ContextId, daemon_ids: &[DaemonId]) -> Option<(DaemonId, ContextId)> {
        daemon_ids.iter().find_map(|daemon_id| {
            self.locks
                .get(daemon_id)
                .filter(|holder| **holder != id)
                .map(|holder| (*daemon_id, *holder))
        })
    }

    fn release_locks(&mut self, id: ContextId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != id);
        before - self.locks.len()
    }
}

/// Registry of live contexts and the daemon locks they hold.
#[derive(Debug, Default)]
pub struct TransactionTable {
    inner: Mutex<Inner>,
}

impl TransactionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new context.
    pub fn insert(&self, id: ContextId, user_id: UserId, expires_at: DateTime<Utc>) {
        self.inner
            .lock()
            .live
            .insert(id, LiveEntry::new(user_id, expires_at));
    }

    /// Move the expiry of a live context.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Expired` if the context is not live.
    pub fn touch(&self, id: ContextId, expires_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.live.get_mut(&id).ok_or(ConfigError::Expired(id))?;
        entry.expires_at = expires_at;
        Ok(())
    }

    /// Whether the context is live.
    #[must_use]
    pub fn is_live(&self, id: ContextId) -> bool {
        self.inner.lock().live.contains_key(&id)
    }

    /// Owner of a live context.
    #[must_use]
    pub fn owner(&self, id: ContextId) -> Option<UserId> {
        self.inner.lock().live.get(&id).map(|e| e.user_id)
    }

    /// The context holding the lock on `daemon_id`, if any.
    #[must_use]
    pub fn holder(&self, daemon_id: DaemonId) -> Option<ContextId> {
        self.inner.lock().locks.get(&daemon_id).copied()
    }

    /// Lock `daemon_ids` for `ctx`, all or nothing.
    ///
    /// Locks the context already holds are granted again.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Expired` if the context is not live and
    /// `ConfigError::Locked` naming the first contended daemon. Nothing is
    /// locked when an error is returned.
    pub fn lock(&self, ctx: &mut ConfigContext, daemon_ids: &[DaemonId]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.live.contains_key(&ctx.id) {
            return Err(ConfigError::Expired(ctx.id));
        }
        if let Some((daemon_id, holder)) = inner.conflict(ctx.id, daemon_ids) {
            return Err(ConfigError::Locked { daemon_id, holder });
        }
        for daemon_id in daemon_ids {
            inner.locks.insert(*daemon_id, ctx.id);
            if !ctx.locked_daemons.contains(daemon_id) {
                ctx.locked_daemons.push(*daemon_id);
            }
        }
        Ok(())
    }

    /// Make a recovered context live again, re-acquiring its locks.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Locked` if another context took one of its
    /// daemons meanwhile. The table is left unchanged in that case.
    pub fn restore(&self, ctx: &ConfigContext, expires_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some((daemon_id, holder)) = inner.conflict(ctx.id, &ctx.locked_daemons) {
            return Err(ConfigError::Locked { daemon_id, holder });
        }
        inner
            .live
            .insert(ctx.id, LiveEntry::new(ctx.user_id, expires_at));
        for daemon_id in &ctx.locked_daemons {
            inner.locks.insert(*daemon_id, ctx.id);
        }
        Ok(())
    }

    /// Forget a context and drop its locks. Returns whether it was live.
    pub fn release(&self, id: ContextId) -> bool {
        let mut inner = self.inner.lock();
        let released = inner.release_locks(id);
        let was_live = inner.live.remove(&id).is_some();
        if was_live || released > 0 {
            tracing::debug!(context_id = %id, locks = released, "Released configuration context");
        }
        was_live
    }

    /// Keep a live context from expiring until the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Expired` if the context is not live.
    pub fn pin(&self, id: ContextId) -> Result<CommitPin<'_>> {
        let mut inner = self.inner.lock();
        let entry = inner.live.get_mut(&id).ok_or(ConfigError::Expired(id))?;
        entry.committing = true;
        Ok(CommitPin { table: self, id })
    }

    /// Whether the context is pinned by a commit in progress.
    #[must_use]
    pub fn is_pinned(&self, id: ContextId) -> bool {
        self.inner
            .lock()
            .live
            .get(&id)
            .is_some_and(|entry| entry.committing)
    }

    /// Unpinned contexts whose expiry is at or before `now`.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<ContextId> {
        self.inner
            .lock()
            .live
            .iter()
            .filter(|(_, entry)| !entry.committing && entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Whether no context is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().live.is_empty()
    }
}

/// Guard returned by [`TransactionTable::pin`].
#[derive(Debug)]
pub struct CommitPin<'a> {
    table: &'a TransactionTable,
    id: ContextId,
}

impl Drop for CommitPin<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.table.inner.lock().live.get_mut(&self.id) {
            entry.committing = false;
        }
    }
}
