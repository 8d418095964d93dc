//! Configuration transaction manager.
//!
//! The manager owns the lifecycle of a context:
//!
//! ```text
//! create_context ─▶ begin/apply (0..n) ─┬─▶ commit ─▶ released
//!        │                ▲             ├─▶ done   ─▶ released
//!        ▼                │             └─▶ TTL    ─▶ reclaimed
//! remember_context ─▶ recover_context
//! ```
//!
//! Commit is at-least-attempted, not all-or-nothing. Each staged command is
//! applied to its daemon independently, and a failure part way through does
//! not undo what was already sent. Updates that went through are marked
//! committed so a later `commit` of the same context does not resend them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{ContextId, DaemonId, UserId};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, Result};
use crate::module::ConfigModule;
use crate::persist::ContextStore;
use crate::table::TransactionTable;
use crate::types::{ConfigContext, ManagerConfig};

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Coordinates configuration transactions.
pub struct ConfigManager {
    table: Arc<TransactionTable>,
    contexts: Arc<dyn ContextStore>,
    modules: RwLock<HashMap<&'static str, Arc<dyn ConfigModule>>>,
    next_id: AtomicI64,
    config: ManagerConfig,
}

impl ConfigManager {
    /// Create a manager remembering contexts in `contexts`.
    ///
    /// Context IDs continue from the current time in milliseconds so that
    /// they do not collide with contexts remembered by an earlier process.
    #[must_use]
    pub fn new(contexts: Arc<dyn ContextStore>, config: ManagerConfig) -> Self {
        Self {
            table: Arc::new(TransactionTable::new()),
            contexts,
            modules: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(Utc::now().timestamp_millis()),
            config,
        }
    }

    /// The lock table, shared with configuration modules.
    #[must_use]
    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    /// Register a module to commit updates tagged with its name.
    pub fn register_module(&self, module: Arc<dyn ConfigModule>) {
        let name = module.name();
        self.modules.write().insert(name, module);
        tracing::debug!(module = name, "Registered configuration module");
    }

    fn module(&self, name: &str) -> Option<Arc<dyn ConfigModule>> {
        self.modules.read().get(name).cloned()
    }

    /// Create a fresh context owned by `user_id`.
    ///
    /// The context lives for the default TTL unless it is remembered with
    /// its own.
    #[must_use]
    pub fn create_context(&self, user_id: UserId) -> ConfigContext {
        let id = ContextId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ctx = ConfigContext::new(id, user_id);
        self.table
            .insert(id, user_id, expiry_after(self.config.default_ttl));
        tracing::debug!(context_id = %id, user_id = %user_id, "Created configuration context");
        ctx
    }

    /// Lock `daemon_ids` for an update in place.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Locked` if another context holds one of the
    /// daemons, leaving every lock as it was, and `ConfigError::Expired` if
    /// the context was reclaimed.
    pub fn begin_update(&self, ctx: &mut ConfigContext, daemon_ids: &[DaemonId]) -> Result<()> {
        self.table.lock(ctx, daemon_ids).inspect_err(|e| {
            tracing::info!(context_id = %ctx.id, error = %e, "Could not begin update");
        })
    }

    /// Commit every staged update in order, then release the context.
    ///
    /// Updates already committed by an earlier call are skipped. Cancellation
    /// is honored between updates only; an update that started sending runs
    /// to completion or failure. The context cannot expire while the commit
    /// runs, and a remembered copy is rewritten after each update so that a
    /// recovered context does not resend it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Expired` if the context was reclaimed,
    /// `ConfigError::Cancelled` if `cancel` fired, and
    /// `ConfigError::CommitFailed` for the first update that failed. The
    /// context stays live after an error.
    pub async fn commit(&self, ctx: &mut ConfigContext, cancel: &CancellationToken) -> Result<()> {
        let _pin = self.table.pin(ctx.id)?;

        for index in 0..ctx.state.updates.len() {
            let update = &ctx.state.updates[index];
            if update.committed {
                continue;
            }
            if cancel.is_cancelled() {
                tracing::info!(context_id = %ctx.id, index, "Commit cancelled");
                return Err(ConfigError::Cancelled { index });
            }

            let outcome = match self.module(&update.module) {
                Some(module) => module.commit_update(update).await,
                None => Err(ConfigError::UnknownModule(update.module.clone())),
            };
            if let Err(source) = outcome {
                tracing::warn!(
                    context_id = %ctx.id,
                    index,
                    operation = %update.operation,
                    error = %source,
                    "Configuration update failed"
                );
                return Err(ConfigError::CommitFailed {
                    index,
                    operation: update.operation.clone(),
                    source: Box::new(source),
                });
            }
            ctx.state.updates[index].committed = true;
            self.save_progress(ctx)?;
        }

        tracing::info!(
            context_id = %ctx.id,
            updates = ctx.state.updates.len(),
            "Committed configuration context"
        );
        self.done(ctx.id)
    }

    /// Rewrite the remembered copy of `ctx`, if there is one, keeping its expiry.
    fn save_progress(&self, ctx: &ConfigContext) -> Result<()> {
        if let Some(stored) = self.contexts.load(ctx.id)? {
            self.contexts.save(ctx, stored.expires_at)?;
        }
        Ok(())
    }

    /// Remember `ctx` for `ttl` so it can be recovered by a later request.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Expired` if the context was reclaimed, or a
    /// storage error.
    pub fn remember_context(&self, ctx: &ConfigContext, ttl: Duration) -> Result<()> {
        let expires_at = expiry_after(ttl);
        self.table.touch(ctx.id, expires_at)?;
        self.contexts.save(ctx, expires_at)?;
        tracing::debug!(context_id = %ctx.id, expires_at = %expires_at, "Remembered configuration context");
        Ok(())
    }

    /// Recover a remembered context for `user_id`.
    ///
    /// Returns `None` when no such context exists, when it expired (it is
    /// reclaimed on the spot), or when it belongs to another user. A context
    /// recovered after a restart gets its locks back.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Locked` if another context took one of its
    /// daemons meanwhile, or a storage error.
    pub fn recover_context(&self, id: ContextId, user_id: UserId) -> Result<Option<ConfigContext>> {
        let Some(stored) = self.contexts.load(id)? else {
            return Ok(None);
        };
        if stored.context.user_id != user_id {
            tracing::warn!(
                context_id = %id,
                user_id = %user_id,
                "Refusing to recover configuration context of another user"
            );
            return Ok(None);
        }
        if stored.expires_at <= Utc::now() {
            if !self.table.is_pinned(id) {
                self.reclaim(id)?;
            }
            return Ok(None);
        }

        if !self.table.is_live(id) {
            self.table.restore(&stored.context, stored.expires_at)?;
            // Keep fresh IDs clear of the recovered one
            self.next_id.fetch_max(id.get() + 1, Ordering::Relaxed);
            tracing::info!(context_id = %id, "Recovered configuration context");
        }
        Ok(Some(stored.context))
    }

    /// Abandon a context without committing. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the remembered copy cannot be removed.
    pub fn done(&self, id: ContextId) -> Result<()> {
        self.table.release(id);
        self.contexts.remove(id)
    }

    fn reclaim(&self, id: ContextId) -> Result<()> {
        tracing::info!(context_id = %id, "Reclaiming expired configuration context");
        self.done(id)
    }

    /// Reclaim every expired context and its locks. Returns how many.
    ///
    /// Contexts pinned by a commit in progress are left alone.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub fn reap_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut ids = self.table.expired(now);
        for id in self.contexts.expired(now)? {
            if !ids.contains(&id) && !self.table.is_pinned(id) {
                ids.push(id);
            }
        }

        for id in &ids {
            self.reclaim(*id)?;
        }
        Ok(ids.len())
    }

    /// Run [`reap_expired`](Self::reap_expired) every `reap_interval` until
    /// `cancel` fires.
    #[must_use]
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => match manager.reap_expired() {
                        Ok(0) => {}
                        Ok(reaped) => tracing::info!(reaped, "Reclaimed expired configuration contexts"),
                        Err(e) => tracing::error!(error = %e, "Failed to reclaim expired contexts"),
                    },
                }
            }
            tracing::debug!("Context reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryContextStore, PersistentContextStore};
    use crate::types::Update;
    use async_trait::async_trait;
    use fleet_store::RocksStore;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records committed operations and fails the ones it is told to.
    #[derive(Default)]
    struct RecordingModule {
        committed: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
    }

    impl RecordingModule {
        fn fail_on(&self, operation: &str) {
            self.failing.lock().push(operation.to_string());
        }

        fn heal(&self) {
            self.failing.lock().clear();
        }

        fn committed(&self) -> Vec<String> {
            self.committed.lock().clone()
        }
    }

    #[async_trait]
    impl ConfigModule for RecordingModule {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn commit_update(&self, update: &Update) -> Result<()> {
            self.committed.lock().push(update.operation.clone());
            if self.failing.lock().contains(&update.operation) {
                return Err(ConfigError::DaemonError {
                    daemon: "dhcp4".to_string(),
                    command: update.operation.clone(),
                    text: "refused".to_string(),
                });
            }
            Ok(())
        }
    }

    fn manager_with(config: ManagerConfig) -> (ConfigManager, Arc<RecordingModule>) {
        let manager = ConfigManager::new(Arc::new(MemoryContextStore::new()), config);
        let module = Arc::new(RecordingModule::default());
        manager.register_module(module.clone());
        (manager, module)
    }

    fn manager() -> (ConfigManager, Arc<RecordingModule>) {
        manager_with(ManagerConfig::default())
    }

    fn stage(ctx: &mut ConfigContext, operations: &[&str]) {
        for (i, operation) in operations.iter().enumerate() {
            let daemon = DaemonId::new(i64::try_from(i).unwrap());
            ctx.set_update(Update::new("recording", *operation, vec![daemon]));
        }
    }

    #[test]
    fn contexts_get_distinct_ids() {
        let (manager, _) = manager();
        let a = manager.create_context(UserId::new(1));
        let b = manager.create_context(UserId::new(1));
        assert_ne!(a.id, b.id);
        assert!(a.state.updates.is_empty());
        assert!(!a.state.scheduled);
    }

    #[tokio::test]
    async fn failed_update_is_reported_and_earlier_ones_not_resent() {
        let (manager, module) = manager();
        let mut ctx = manager.create_context(UserId::new(1));
        stage(&mut ctx, &["first", "second", "third"]);
        module.fail_on("second");

        let err = manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CommitFailed { index: 1, ref operation, .. } if operation == "second"
        ));
        assert_eq!(module.committed(), vec!["first", "second"]);
        assert!(ctx.state.updates[0].committed);
        assert!(!ctx.state.updates[1].committed);

        module.heal();
        manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(module.committed(), vec!["first", "second", "second", "third"]);
        assert!(!manager.table().is_live(ctx.id));
    }

    #[tokio::test]
    async fn recovered_context_resumes_after_partial_failure() {
        let (manager, module) = manager();
        let mut ctx = manager.create_context(UserId::new(1));
        stage(&mut ctx, &["first", "second"]);
        manager
            .remember_context(&ctx, Duration::from_secs(60))
            .unwrap();
        module.fail_on("second");

        manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        module.heal();

        let mut recovered = manager
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .unwrap();
        assert!(recovered.state.updates[0].committed);
        manager
            .commit(&mut recovered, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(module.committed(), vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn progress_survives_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let contexts: Arc<dyn ContextStore> = Arc::new(PersistentContextStore::new(store));

        let before = ConfigManager::new(contexts.clone(), ManagerConfig::default());
        let module = Arc::new(RecordingModule::default());
        before.register_module(module.clone());
        let mut ctx = before.create_context(UserId::new(1));
        stage(&mut ctx, &["first", "second"]);
        before
            .remember_context(&ctx, Duration::from_secs(60))
            .unwrap();
        module.fail_on("second");
        before
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        let after = ConfigManager::new(contexts, ManagerConfig::default());
        let recovered = after
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .unwrap();
        let committed: Vec<bool> = recovered
            .state
            .updates
            .iter()
            .map(|u| u.committed)
            .collect();
        assert_eq!(committed, vec![true, false]);
    }

    /// Blocks inside `commit_update` until released.
    #[derive(Default)]
    struct GateModule {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ConfigModule for GateModule {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn commit_update(&self, _: &Update) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_in_progress_is_not_reaped() {
        let manager = Arc::new(ConfigManager::new(
            Arc::new(MemoryContextStore::new()),
            ManagerConfig {
                default_ttl: Duration::ZERO,
                ..ManagerConfig::default()
            },
        ));
        let gate = Arc::new(GateModule::default());
        manager.register_module(gate.clone());

        let mut ctx = manager.create_context(UserId::new(1));
        manager.begin_update(&mut ctx, &[DaemonId::new(5)]).unwrap();
        stage(&mut ctx, &["first"]);
        let id = ctx.id;

        let committing = Arc::clone(&manager);
        let task = tokio::spawn(async move {
            committing
                .commit(&mut ctx, &CancellationToken::new())
                .await
        });

        gate.entered.notified().await;
        assert_eq!(manager.reap_expired().unwrap(), 0);
        assert_eq!(manager.table().holder(DaemonId::new(5)), Some(id));

        let mut other = manager.create_context(UserId::new(2));
        assert!(matches!(
            manager.begin_update(&mut other, &[DaemonId::new(5)]),
            Err(ConfigError::Locked { .. })
        ));

        gate.release.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(manager.table().holder(DaemonId::new(5)), None);
    }

    #[tokio::test]
    async fn unknown_module_fails_commit() {
        let (manager, _) = manager();
        let mut ctx = manager.create_context(UserId::new(1));
        ctx.set_update(Update::new("bind9", "zone_add", Vec::new()));

        let err = manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        let ConfigError::CommitFailed { source, .. } = err else {
            panic!("expected a commit failure");
        };
        assert!(matches!(*source, ConfigError::UnknownModule(_)));
    }

    #[tokio::test]
    async fn cancellation_is_honored_between_updates() {
        let (manager, module) = manager();
        let mut ctx = manager.create_context(UserId::new(1));
        stage(&mut ctx, &["first"]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager.commit(&mut ctx, &cancel).await.unwrap_err();
        assert!(matches!(err, ConfigError::Cancelled { index: 0 }));
        assert!(module.committed().is_empty());
        assert!(manager.table().is_live(ctx.id));
    }

    #[test]
    fn lock_conflict_is_distinguishable() {
        let (manager, _) = manager();
        let mut first = manager.create_context(UserId::new(1));
        let mut second = manager.create_context(UserId::new(2));

        manager.begin_update(&mut first, &[DaemonId::new(5)]).unwrap();
        let err = manager
            .begin_update(&mut second, &[DaemonId::new(5)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Locked { holder, .. } if holder == first.id));
        assert_eq!(err.http_status_code(), 423);
        assert_eq!(manager.table().holder(DaemonId::new(5)), Some(first.id));

        manager.done(first.id).unwrap();
        manager.done(first.id).unwrap();
        manager.begin_update(&mut second, &[DaemonId::new(5)]).unwrap();
    }

    #[test]
    fn recover_enforces_ownership() {
        let (manager, _) = manager();
        let mut ctx = manager.create_context(UserId::new(1));
        stage(&mut ctx, &["first"]);
        manager
            .remember_context(&ctx, Duration::from_secs(60))
            .unwrap();

        assert!(manager
            .recover_context(ctx.id, UserId::new(2))
            .unwrap()
            .is_none());
        let recovered = manager
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .unwrap();
        assert_eq!(recovered, ctx);

        manager.done(ctx.id).unwrap();
        assert!(manager
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_context_is_reclaimed() {
        let (manager, _) = manager_with(ManagerConfig {
            default_ttl: Duration::ZERO,
            ..ManagerConfig::default()
        });
        let mut ctx = manager.create_context(UserId::new(1));
        manager.begin_update(&mut ctx, &[DaemonId::new(5)]).unwrap();

        assert_eq!(manager.reap_expired().unwrap(), 1);
        assert_eq!(manager.table().holder(DaemonId::new(5)), None);

        let err = manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Expired(id) if id == ctx.id));
        assert!(matches!(
            manager.remember_context(&ctx, Duration::from_secs(60)),
            Err(ConfigError::Expired(_))
        ));
    }

    #[test]
    fn remembered_context_expires() {
        let (manager, _) = manager();
        let ctx = manager.create_context(UserId::new(1));
        manager.remember_context(&ctx, Duration::ZERO).unwrap();

        assert!(manager
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .is_none());
        assert!(!manager.table().is_live(ctx.id));
    }

    #[tokio::test]
    async fn reaper_runs_until_cancelled() {
        let (manager, _) = manager_with(ManagerConfig {
            default_ttl: Duration::ZERO,
            reap_interval: Duration::from_millis(10),
        });
        let manager = Arc::new(manager);
        let ctx = manager.create_context(UserId::new(1));

        let cancel = CancellationToken::new();
        let reaper = manager.spawn_reaper(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.table().is_live(ctx.id));

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[test]
    fn recovery_after_restart_reacquires_locks() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let contexts: Arc<dyn ContextStore> = Arc::new(PersistentContextStore::new(store));

        let before = ConfigManager::new(contexts.clone(), ManagerConfig::default());
        let mut ctx = before.create_context(UserId::new(1));
        before.begin_update(&mut ctx, &[DaemonId::new(5)]).unwrap();
        before
            .remember_context(&ctx, Duration::from_secs(60))
            .unwrap();

        let after = ConfigManager::new(contexts, ManagerConfig::default());
        let recovered = after
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .unwrap();
        assert!(recovered.state.scheduled);
        assert_eq!(recovered.locked_daemons, vec![DaemonId::new(5)]);

        let mut other = after.create_context(UserId::new(2));
        let err = after
            .begin_update(&mut other, &[DaemonId::new(5)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Locked { .. }));
    }
}
