//! Transaction context and staged update types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_agentcomm::{ControlledDaemon, DaemonCommand};
use fleet_core::{ContextId, DaemonId, UserId};
use fleet_store::{App, Host};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for the transaction manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lifetime of a context that is never remembered with its own TTL.
    pub default_ttl: Duration,
    /// How often the background reaper looks for expired contexts.
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Where a staged command is delivered.
///
/// A context staged in this process holds the live app; a context recovered
/// from persistent storage only holds the snapshot. Both resolve the same
/// way at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandTarget {
    /// The daemon's app as loaded from the database.
    Live {
        /// The owning application.
        app: App,
        /// The daemon name within the app.
        daemon_name: String,
    },
    /// A serializable reference taken at staging time.
    Snapshot(ControlledDaemon),
}

impl CommandTarget {
    /// Resolve to the reference the forwarder needs.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Address` if a stored address is not a valid
    /// endpoint.
    pub fn resolve(&self) -> Result<ControlledDaemon> {
        match self {
            Self::Live { app, daemon_name } => Ok(ControlledDaemon {
                machine: app.machine.endpoint()?,
                daemon_name: daemon_name.clone(),
                control: app.control_endpoint()?,
                control_secure: app.use_secure_protocol,
            }),
            Self::Snapshot(daemon) => Ok(daemon.clone()),
        }
    }

    /// Convert to the snapshot form.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn to_snapshot(&self) -> Result<Self> {
        self.resolve().map(Self::Snapshot)
    }

    /// The daemon name the command is addressed to.
    #[must_use]
    pub fn daemon_name(&self) -> &str {
        match self {
            Self::Live { daemon_name, .. } => daemon_name,
            Self::Snapshot(daemon) => &daemon.daemon_name,
        }
    }
}

/// A command bound to the daemon that receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedCommand {
    /// The command to send.
    pub command: DaemonCommand,
    /// The receiving daemon.
    pub target: CommandTarget,
}

/// Data a module staged for one update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Commands to send at commit, in order.
    #[serde(default)]
    pub commands: Vec<StagedCommand>,
    /// The host as it was when an in-place update began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_before_update: Option<Host>,
}

/// One staged operation of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// The module that commits this update.
    pub module: String,
    /// Operation tag (e.g. `host_add`).
    pub operation: String,
    /// Daemons the update targets.
    pub daemon_ids: Vec<DaemonId>,
    /// Staged data.
    pub recipe: Recipe,
    /// Whether the update was already sent by an earlier commit.
    #[serde(default)]
    pub committed: bool,
}

impl Update {
    /// Create an update with an empty recipe.
    #[must_use]
    pub fn new(
        module: impl Into<String>,
        operation: impl Into<String>,
        daemon_ids: Vec<DaemonId>,
    ) -> Self {
        Self {
            module: module.into(),
            operation: operation.into(),
            daemon_ids,
            recipe: Recipe::default(),
            committed: false,
        }
    }
}

/// The staged content of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    /// Updates in staging order; commit follows this order.
    pub updates: Vec<Update>,
    /// Whether the context was rehydrated from persistent storage.
    #[serde(default)]
    pub scheduled: bool,
}

/// An in-progress configuration change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigContext {
    /// Context identifier.
    pub id: ContextId,
    /// The user who owns the context.
    pub user_id: UserId,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
    /// Daemons locked by this context.
    #[serde(default)]
    pub locked_daemons: Vec<DaemonId>,
    /// Staged updates.
    pub state: TransactionState,
}

impl ConfigContext {
    /// Create an empty context.
    #[must_use]
    pub fn new(id: ContextId, user_id: UserId) -> Self {
        Self {
            id,
            user_id,
            created_at: Utc::now(),
            locked_daemons: Vec::new(),
            state: TransactionState::default(),
        }
    }

    /// Find the staged update for `operation`.
    #[must_use]
    pub fn update(&self, operation: &str) -> Option<&Update> {
        self.state.updates.iter().find(|u| u.operation == operation)
    }

    /// Find the staged update for `operation`, mutably.
    pub fn update_mut(&mut self, operation: &str) -> Option<&mut Update> {
        self.state
            .updates
            .iter_mut()
            .find(|u| u.operation == operation)
    }

    /// Replace the update with the same operation, or append it.
    pub fn set_update(&mut self, update: Update) {
        match self.update_mut(&update.operation) {
            Some(existing) => *existing = update,
            None => self.state.updates.push(update),
        }
    }

    /// A copy whose command targets are all snapshots.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Address` if a live target has an invalid address.
    pub fn to_snapshot(&self) -> Result<Self> {
        let mut snapshot = self.clone();
        for update in &mut snapshot.state.updates {
            for staged in &mut update.recipe.commands {
                staged.target = staged.target.to_snapshot()?;
            }
        }
        Ok(snapshot)
    }
}
