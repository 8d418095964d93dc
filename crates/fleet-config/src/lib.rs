//! Configuration transactions for the fleet control plane.
//!
//! A configuration change is staged into a [`ConfigContext`] by a
//! daemon-family module, then committed by the [`ConfigManager`], which hands
//! each staged update back to its module for delivery through the command
//! forwarder.
//!
//! # Architecture
//!
//! ```text
//!   caller
//!     │ create_context / commit / done
//!     ▼
//! ┌───────────────┐ begin_update ┌──────────────────┐
//! │ ConfigManager │─────────────▶│ TransactionTable │◀─┐ lock
//! └──────┬────────┘              │ contexts + locks │  │
//!        │ commit_update         └──────────────────┘  │
//!        ▼                                             │
//! ┌───────────────┐  begin_host_* / apply_host_*   ┌───┴────┐
//! │ ConfigModule  │◀───────────────────────────────│ caller │
//! │  (KeaModule)  │                                └────────┘
//! └──────┬────────┘
//!        │ forward_command
//!        ▼
//!  CommandForwarder ─▶ agent ─▶ daemon
//! ```
//!
//! Remembered contexts go to a [`ContextStore`]; the persistent one writes
//! serializable snapshots, so a context recovered from it is `scheduled`
//! and its commands target [`CommandTarget::Snapshot`]s.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = manager.create_context(user_id);
//! kea.begin_host_update(&mut ctx, host_id)?;
//! kea.apply_host_update(&mut ctx, &edited_host)?;
//! manager.commit(&mut ctx, &CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kea;
pub mod manager;
pub mod module;
pub mod persist;
pub mod table;
pub mod types;

pub use error::{ConfigError, Result};
pub use kea::KeaModule;
pub use manager::ConfigManager;
pub use module::ConfigModule;
pub use persist::{ContextStore, MemoryContextStore, PersistentContextStore, StoredContext};
pub use table::TransactionTable;
pub use types::{
    CommandTarget, ConfigContext, ManagerConfig, Recipe, StagedCommand, TransactionState, Update,
};
