//! Kea host reservation module.
//!
//! Translates host reservations into the Kea `host_cmds` commands that
//! apply them to each DHCP daemon the host is configured in.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_agentcomm::{first_error, CommandForwarder, DaemonCommand};
use fleet_core::HostId;
use fleet_store::{Host, Store};
use serde_json::{json, Map, Value};

use crate::error::{ConfigError, Result};
use crate::module::ConfigModule;
use crate::table::TransactionTable;
use crate::types::{CommandTarget, ConfigContext, StagedCommand, Update};

/// Operation tag for adding a host reservation.
pub const HOST_ADD: &str = "host_add";
/// Operation tag for replacing a host reservation.
pub const HOST_UPDATE: &str = "host_update";
/// Operation tag for deleting a host reservation.
pub const HOST_DELETE: &str = "host_delete";

const RESERVATION_ADD: &str = "reservation-add";
const RESERVATION_DEL: &str = "reservation-del";

/// Configuration module for Kea DHCP daemons.
pub struct KeaModule<S: Store> {
    store: Arc<S>,
    forwarder: Arc<CommandForwarder>,
    table: Arc<TransactionTable>,
}

impl<S: Store> KeaModule<S> {
    /// Name updates staged by this module are tagged with.
    pub const NAME: &'static str = "kea";

    /// Create the module.
    ///
    /// `table` must be the lock table of the manager the module is
    /// registered with.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        forwarder: Arc<CommandForwarder>,
        table: Arc<TransactionTable>,
    ) -> Self {
        Self {
            store,
            forwarder,
            table,
        }
    }

    /// Begin adding a host reservation. Nothing needs locking for an add.
    ///
    /// # Errors
    ///
    /// Currently never fails.
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    pub fn begin_host_add(&self, _ctx: &mut ConfigContext) -> Result<()> {
        Ok(())
    }

    /// Stage a `reservation-add` for every daemon the host is configured in.
    ///
    /// # Errors
    ///
    /// Returns a data-integrity error if the host has no daemons, a daemon
    /// was not loaded, or a daemon has no app. The context is unchanged.
    pub fn apply_host_add(&self, ctx: &mut ConfigContext, host: &Host) -> Result<()> {
        let commands = stage(host, HOST_ADD, RESERVATION_ADD, reservation_add_args)?;
        let mut update = Update::new(Self::NAME, HOST_ADD, host.daemon_ids());
        update.recipe.commands = commands;
        ctx.set_update(update);
        tracing::debug!(context_id = %ctx.id, host_id = %host.id, "Staged host reservation add");
        Ok(())
    }

    /// Begin replacing the host `host_id`: lock its daemons and remember
    /// the host as it is now.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::HostNotFound` if the host does not exist and
    /// `ConfigError::Locked` if one of its daemons is locked by another
    /// context.
    pub fn begin_host_update(&self, ctx: &mut ConfigContext, host_id: HostId) -> Result<()> {
        let host = self.load_host(host_id)?;
        let daemon_ids = host.daemon_ids();
        self.table.lock(ctx, &daemon_ids)?;

        let mut update = Update::new(Self::NAME, HOST_UPDATE, daemon_ids);
        update.recipe.host_before_update = Some(host);
        ctx.set_update(update);
        Ok(())
    }

    /// Stage the replacement of the host begun with
    /// [`begin_host_update`](Self::begin_host_update).
    ///
    /// The old reservation is deleted from the daemons it was in, then the
    /// new one is added to the daemons it is in now.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoPendingUpdate` without a prior begin, the
    /// same data-integrity errors as [`apply_host_add`](Self::apply_host_add),
    /// and `ConfigError::Locked` if the host moved to a daemon locked
    /// elsewhere.
    pub fn apply_host_update(&self, ctx: &mut ConfigContext, host: &Host) -> Result<()> {
        let before = ctx
            .update(HOST_UPDATE)
            .and_then(|u| u.recipe.host_before_update.clone())
            .ok_or(ConfigError::NoPendingUpdate {
                operation: HOST_UPDATE,
            })?;

        let mut commands = stage(&before, HOST_UPDATE, RESERVATION_DEL, reservation_del_args)?;
        commands.extend(stage(host, HOST_UPDATE, RESERVATION_ADD, reservation_add_args)?);

        let mut daemon_ids = before.daemon_ids();
        for id in host.daemon_ids() {
            if !daemon_ids.contains(&id) {
                daemon_ids.push(id);
            }
        }
        self.table.lock(ctx, &daemon_ids)?;

        let mut update = Update::new(Self::NAME, HOST_UPDATE, daemon_ids);
        update.recipe.commands = commands;
        update.recipe.host_before_update = Some(before);
        ctx.set_update(update);
        tracing::debug!(context_id = %ctx.id, host_id = %host.id, "Staged host reservation update");
        Ok(())
    }

    /// Begin deleting the host `host_id` by locking its daemons.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::HostNotFound` if the host does not exist and
    /// `ConfigError::Locked` if one of its daemons is locked by another
    /// context.
    pub fn begin_host_delete(&self, ctx: &mut ConfigContext, host_id: HostId) -> Result<()> {
        let host = self.load_host(host_id)?;
        self.table.lock(ctx, &host.daemon_ids())
    }

    /// Stage a `reservation-del` for every daemon the host is configured in.
    ///
    /// # Errors
    ///
    /// Same as [`apply_host_add`](Self::apply_host_add), plus
    /// `ConfigError::Locked` if one of the daemons is locked elsewhere.
    pub fn apply_host_delete(&self, ctx: &mut ConfigContext, host: &Host) -> Result<()> {
        let commands = stage(host, HOST_DELETE, RESERVATION_DEL, reservation_del_args)?;
        let daemon_ids = host.daemon_ids();
        self.table.lock(ctx, &daemon_ids)?;

        let mut update = Update::new(Self::NAME, HOST_DELETE, daemon_ids);
        update.recipe.commands = commands;
        ctx.set_update(update);
        tracing::debug!(context_id = %ctx.id, host_id = %host.id, "Staged host reservation delete");
        Ok(())
    }

    fn load_host(&self, host_id: HostId) -> Result<Host> {
        self.store
            .get_host(host_id)?
            .ok_or(ConfigError::HostNotFound(host_id))
    }

    async fn send_commands(&self, update: &Update) -> Result<()> {
        for staged in &update.recipe.commands {
            let target = staged.target.resolve()?;
            let responses = self
                .forwarder
                .forward_command(&target, &staged.command)
                .await?;
            if let Some(error) = first_error(&responses) {
                return Err(ConfigError::DaemonError {
                    daemon: target.daemon_name,
                    command: staged.command.command.clone(),
                    text: error
                        .text
                        .clone()
                        .unwrap_or_else(|| format!("result {}", error.result)),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store> ConfigModule for KeaModule<S> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn commit_update(&self, update: &Update) -> Result<()> {
        match update.operation.as_str() {
            HOST_ADD | HOST_UPDATE | HOST_DELETE => self.send_commands(update).await,
            other => Err(ConfigError::UnknownOperation {
                module: Self::NAME.to_string(),
                operation: other.to_string(),
            }),
        }
    }
}

type ArgumentsFn = fn(&Host, &str) -> Result<Value>;

/// Bind `command` to every daemon of `host`.
fn stage(
    host: &Host,
    operation: &'static str,
    command: &str,
    arguments: ArgumentsFn,
) -> Result<Vec<StagedCommand>> {
    if host.local_hosts.is_empty() {
        return Err(ConfigError::NoDaemons {
            operation,
            host_id: host.id,
        });
    }

    host.local_hosts
        .iter()
        .map(|local| {
            let daemon = local.daemon.as_ref().ok_or(ConfigError::MissingDaemon {
                daemon_id: local.daemon_id,
            })?;
            let app = daemon
                .app
                .as_ref()
                .ok_or(ConfigError::MissingApp { daemon_id: daemon.id })?;
            Ok(StagedCommand {
                command: DaemonCommand::new(
                    command,
                    vec![daemon.name.clone()],
                    Some(arguments(host, &daemon.name)?),
                ),
                target: CommandTarget::Live {
                    app: app.clone(),
                    daemon_name: daemon.name.clone(),
                },
            })
        })
        .collect()
}

fn subnet_id(host: &Host) -> i64 {
    // Zero addresses global reservations
    host.subnet_id.unwrap_or(0)
}

/// Arguments of `reservation-add`.
fn reservation_add_args(host: &Host, daemon_name: &str) -> Result<Value> {
    if host.identifiers.is_empty() {
        return Err(ConfigError::MissingIdentifier(host.id));
    }

    let mut reservation = Map::new();
    reservation.insert("subnet-id".to_string(), json!(subnet_id(host)));
    for identifier in &host.identifiers {
        reservation.insert(identifier.kind.clone(), json!(identifier.value));
    }
    if daemon_name == "dhcp4" {
        if let Some(address) = host.ip_addresses.first() {
            reservation.insert("ip-address".to_string(), json!(address));
        }
    } else {
        if !host.ip_addresses.is_empty() {
            reservation.insert("ip-addresses".to_string(), json!(host.ip_addresses));
        }
        if !host.prefixes.is_empty() {
            reservation.insert("prefixes".to_string(), json!(host.prefixes));
        }
    }
    if let Some(hostname) = &host.hostname {
        reservation.insert("hostname".to_string(), json!(hostname));
    }

    Ok(json!({ "reservation": reservation }))
}

/// Arguments of `reservation-del`, addressing the host by its first identifier.
fn reservation_del_args(host: &Host, _daemon_name: &str) -> Result<Value> {
    let identifier = host
        .identifiers
        .first()
        .ok_or(ConfigError::MissingIdentifier(host.id))?;
    Ok(json!({
        "subnet-id": subnet_id(host),
        "identifier-type": identifier.kind,
        "identifier": identifier.value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConfigManager;
    use crate::persist::{MemoryContextStore, PersistentContextStore};
    use crate::types::ManagerConfig;
    use fleet_agentcomm::{ConnectionRegistry, ForwarderConfig, ScriptedConnector};
    use fleet_core::{AppId, DaemonId, MachineId, UserId};
    use fleet_hooks::HookManager;
    use fleet_store::{App, Daemon, HostIdentifier, LocalHost, Machine, RocksStore};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn daemon(id: i64, name: &str) -> Daemon {
        Daemon {
            id: DaemonId::new(id),
            name: name.to_string(),
            app: Some(App {
                id: AppId::new(1),
                machine: Machine {
                    id: MachineId::new(1),
                    address: "192.0.2.1".to_string(),
                    agent_port: 8080,
                },
                control_address: "127.0.0.1".to_string(),
                control_port: 8000,
                use_secure_protocol: false,
            }),
        }
    }

    fn host(id: i64, daemons: Vec<Daemon>) -> Host {
        Host {
            id: HostId::new(id),
            subnet_id: Some(7),
            hostname: Some("printer.example.org".to_string()),
            identifiers: vec![HostIdentifier {
                kind: "hw-address".to_string(),
                value: "01:02:03:04:05:06".to_string(),
            }],
            ip_addresses: vec!["192.0.2.50".to_string()],
            prefixes: Vec::new(),
            local_hosts: daemons
                .into_iter()
                .map(|d| LocalHost {
                    daemon_id: d.id,
                    daemon: Some(d),
                })
                .collect(),
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<RocksStore>,
        connector: Arc<ScriptedConnector>,
        manager: Arc<ConfigManager>,
        kea: Arc<KeaModule<RocksStore>>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(RocksStore::open(dir.path()).unwrap());
            let connector = Arc::new(ScriptedConnector::new());
            let manager = Arc::new(ConfigManager::new(
                Arc::new(MemoryContextStore::new()),
                ManagerConfig::default(),
            ));
            let kea = Self::kea_for(&store, &connector, &manager);
            Self {
                _dir: dir,
                store,
                connector,
                manager,
                kea,
            }
        }

        fn kea_for(
            store: &Arc<RocksStore>,
            connector: &Arc<ScriptedConnector>,
            manager: &Arc<ConfigManager>,
        ) -> Arc<KeaModule<RocksStore>> {
            let registry = Arc::new(ConnectionRegistry::new(connector.clone()));
            registry.register_endpoint("192.0.2.1:8080".parse().unwrap());
            let forwarder = Arc::new(CommandForwarder::new(
                registry,
                Arc::new(HookManager::new()),
                ForwarderConfig::default(),
            ));
            let kea = Arc::new(KeaModule::new(
                store.clone(),
                forwarder,
                manager.table().clone(),
            ));
            manager.register_module(kea.clone());
            kea
        }

        fn sent_commands(&self) -> Vec<Value> {
            self.connector
                .requests()
                .iter()
                .map(|(_, body)| serde_json::from_str(body).unwrap())
                .collect()
        }
    }

    #[test]
    fn host_add_stages_command_per_daemon() {
        let fx = Fixture::new();
        let mut ctx = fx.manager.create_context(UserId::new(1));
        let host = host(1, vec![daemon(1, "dhcp4"), daemon(2, "dhcp6")]);

        fx.kea.begin_host_add(&mut ctx).unwrap();
        fx.kea.apply_host_add(&mut ctx, &host).unwrap();

        let update = ctx.update(HOST_ADD).unwrap();
        assert_eq!(update.module, "kea");
        assert_eq!(update.daemon_ids, vec![DaemonId::new(1), DaemonId::new(2)]);
        assert_eq!(update.recipe.commands.len(), 2);

        let v4 = &update.recipe.commands[0];
        assert_eq!(v4.command.command, "reservation-add");
        assert_eq!(v4.command.service, vec!["dhcp4".to_string()]);
        assert_eq!(
            v4.command.arguments,
            Some(json!({"reservation": {
                "subnet-id": 7,
                "hw-address": "01:02:03:04:05:06",
                "ip-address": "192.0.2.50",
                "hostname": "printer.example.org"
            }}))
        );
        assert!(matches!(v4.target, CommandTarget::Live { .. }));

        let v6 = &update.recipe.commands[1];
        assert_eq!(
            v6.command.arguments.as_ref().unwrap()["reservation"]["ip-addresses"],
            json!(["192.0.2.50"])
        );

        // Adds take no locks
        assert!(ctx.locked_daemons.is_empty());
    }

    #[test]
    fn host_add_rejects_incomplete_associations() {
        let fx = Fixture::new();
        let mut ctx = fx.manager.create_context(UserId::new(1));

        let err = fx
            .kea
            .apply_host_add(&mut ctx, &host(1, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoDaemons { .. }));

        let mut unloaded = host(1, vec![daemon(1, "dhcp4")]);
        unloaded.local_hosts[0].daemon = None;
        let err = fx.kea.apply_host_add(&mut ctx, &unloaded).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDaemon { .. }));

        let mut orphan = daemon(1, "dhcp4");
        orphan.app = None;
        let err = fx
            .kea
            .apply_host_add(&mut ctx, &host(1, vec![orphan]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingApp { .. }));

        assert!(ctx.state.updates.is_empty());
    }

    #[test]
    fn host_update_requires_existing_host() {
        let fx = Fixture::new();
        let mut ctx = fx.manager.create_context(UserId::new(1));

        let err = fx
            .kea
            .begin_host_update(&mut ctx, HostId::new(99))
            .unwrap_err();
        assert!(matches!(err, ConfigError::HostNotFound(_)));

        let err = fx
            .kea
            .apply_host_update(&mut ctx, &host(99, vec![daemon(1, "dhcp4")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoPendingUpdate { .. }));
    }

    #[test]
    fn host_update_locks_and_stages_delete_then_add() {
        let fx = Fixture::new();
        let original = host(1, vec![daemon(1, "dhcp4")]);
        fx.store.put_host(&original).unwrap();

        let mut ctx = fx.manager.create_context(UserId::new(1));
        fx.kea.begin_host_update(&mut ctx, original.id).unwrap();
        assert_eq!(ctx.locked_daemons, vec![DaemonId::new(1)]);
        assert_eq!(
            ctx.update(HOST_UPDATE).unwrap().recipe.host_before_update,
            Some(original.clone())
        );

        // A second context cannot begin updating the same host
        let mut other = fx.manager.create_context(UserId::new(2));
        let err = fx
            .kea
            .begin_host_update(&mut other, original.id)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Locked { holder, .. } if holder == ctx.id));

        let mut changed = original.clone();
        changed.hostname = Some("scanner.example.org".to_string());
        fx.kea.apply_host_update(&mut ctx, &changed).unwrap();

        let update = ctx.update(HOST_UPDATE).unwrap();
        let commands: Vec<_> = update
            .recipe
            .commands
            .iter()
            .map(|c| c.command.command.as_str())
            .collect();
        assert_eq!(commands, vec!["reservation-del", "reservation-add"]);
        assert_eq!(
            update.recipe.commands[0].command.arguments,
            Some(json!({
                "subnet-id": 7,
                "identifier-type": "hw-address",
                "identifier": "01:02:03:04:05:06"
            }))
        );
        assert_eq!(ctx.state.updates.len(), 1);
    }

    #[tokio::test]
    async fn commit_sends_staged_commands_and_releases() {
        let fx = Fixture::new();
        let original = host(1, vec![daemon(1, "dhcp4")]);
        fx.store.put_host(&original).unwrap();

        let mut ctx = fx.manager.create_context(UserId::new(1));
        fx.kea.begin_host_delete(&mut ctx, original.id).unwrap();
        fx.kea.apply_host_delete(&mut ctx, &original).unwrap();
        fx.manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        let sent = fx.sent_commands();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["command"], "reservation-del");
        assert_eq!(sent[0]["service"], json!(["dhcp4"]));

        assert!(ctx.state.updates[0].committed);
        assert_eq!(fx.manager.table().holder(DaemonId::new(1)), None);
        assert!(!fx.manager.table().is_live(ctx.id));
    }

    #[tokio::test]
    async fn daemon_error_fails_commit() {
        let fx = Fixture::new();
        fx.connector.push(Ok(
            r#"[{"result": 1, "text": "subnet 7 not found"}]"#.to_string(),
        ));

        let mut ctx = fx.manager.create_context(UserId::new(1));
        fx.kea
            .apply_host_add(&mut ctx, &host(1, vec![daemon(1, "dhcp4")]))
            .unwrap();
        let err = fx
            .manager
            .commit(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ConfigError::CommitFailed {
                index,
                operation,
                source,
            } => {
                assert_eq!(index, 0);
                assert_eq!(operation, HOST_ADD);
                assert!(matches!(
                    *source,
                    ConfigError::DaemonError { ref text, .. } if text == "subnet 7 not found"
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ctx.state.updates[0].committed);
        assert!(fx.manager.table().is_live(ctx.id));
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let fx = Fixture::new();
        let err = fx
            .kea
            .commit_update(&Update::new("kea", "subnet_add", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOperation { .. }));
    }

    #[tokio::test]
    async fn recovered_snapshot_commits_after_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let original = host(1, vec![daemon(1, "dhcp4")]);
        store.put_host(&original).unwrap();
        let contexts = Arc::new(PersistentContextStore::new(store.clone()));

        // Stage and remember in one manager
        let first = Arc::new(ConfigManager::new(contexts.clone(), ManagerConfig::default()));
        let kea = Fixture::kea_for(&store, &Arc::new(ScriptedConnector::new()), &first);
        let mut ctx = first.create_context(UserId::new(1));
        kea.begin_host_update(&mut ctx, original.id).unwrap();
        kea.apply_host_update(&mut ctx, &original).unwrap();
        first
            .remember_context(&ctx, std::time::Duration::from_secs(600))
            .unwrap();

        // Recover and commit in another
        let connector = Arc::new(ScriptedConnector::new());
        let second = Arc::new(ConfigManager::new(contexts, ManagerConfig::default()));
        Fixture::kea_for(&store, &connector, &second);

        assert!(second
            .recover_context(ctx.id, UserId::new(2))
            .unwrap()
            .is_none());
        let mut recovered = second
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .unwrap();
        assert!(recovered.state.scheduled);
        assert_eq!(second.table().holder(DaemonId::new(1)), Some(ctx.id));

        second
            .commit(&mut recovered, &CancellationToken::new())
            .await
            .unwrap();
        let sent: Vec<String> = connector
            .requests()
            .iter()
            .map(|(_, body)| {
                serde_json::from_str::<Value>(body).unwrap()["command"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(sent, vec!["reservation-del", "reservation-add"]);
        assert!(second
            .recover_context(ctx.id, UserId::new(1))
            .unwrap()
            .is_none());
    }
}
