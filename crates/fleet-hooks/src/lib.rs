//! Hook executor and extension points for the fleet control plane.
//!
//! Optional modules ("carriers") intercept well-known extension points of
//! the control plane. Each carrier advertises the callout interfaces it
//! implements when it is registered, and the executor files it into one
//! table per extension point. Calls are then dispatched through a table
//! chosen at compile time, so no per-call type inspection happens.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  register   ┌──────────────────────────────────────┐
//! │   Carrier    │────────────▶│            HookExecutor              │
//! │ (callouts()) │             │ ┌──────────────┐ ┌─────────────────┐ │
//! └──────────────┘             │ │Authentication│ │  BeforeForward  │ │
//!                              │ │    table     │ │      table      │ │
//!                              │ └──────────────┘ └─────────────────┘ │
//!                              └──────────────────────────────────────┘
//!                                  ▲ call_single     ▲ call_sequential
//!                                  │                 │
//!                             HookManager::authenticate / on_before_forward
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use fleet_hooks::{
//!     AuthenticatedUser, AuthenticationCallout, AuthenticationRequest, CalloutCarrier,
//!     Callouts, HookManager,
//! };
//! use fleet_core::UserId;
//!
//! struct StaticUsers;
//!
//! impl AuthenticationCallout for StaticUsers {
//!     fn authenticate(&self, request: &AuthenticationRequest) -> Option<AuthenticatedUser> {
//!         (request.login == "admin").then(|| AuthenticatedUser {
//!             id: UserId::new(1),
//!             login: request.login.clone(),
//!         })
//!     }
//! }
//!
//! impl CalloutCarrier for StaticUsers {
//!     fn name(&self) -> &str {
//!         "static-users"
//!     }
//!
//!     fn callouts(self: Arc<Self>) -> Callouts {
//!         Callouts::default().with_authentication(self)
//!     }
//! }
//!
//! let hooks = HookManager::new();
//! hooks.register(Arc::new(StaticUsers));
//!
//! let user = hooks.authenticate(&AuthenticationRequest::new("admin", "secret"));
//! assert_eq!(user.map(|u| u.id), Some(UserId::new(1)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod carrier;
pub mod error;
pub mod executor;
pub mod manager;
pub mod points;

pub use carrier::{CalloutCarrier, Callouts};
pub use error::{HookError, Result};
pub use executor::HookExecutor;
pub use manager::HookManager;
pub use points::{
    AuthenticatedUser, Authentication, AuthenticationCallout, AuthenticationRequest,
    BeforeForward, BeforeForwardCallout, ExtensionPoint,
};
