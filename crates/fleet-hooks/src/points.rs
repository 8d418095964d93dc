//! Well-known extension points.
//!
//! An extension point is a marker type tying a callout interface to the
//! executor table that holds its implementations.

use std::sync::Arc;

use fleet_core::{AgentEndpoint, UserId};

use crate::executor::CalloutTables;

/// A named interception point with its own callout interface.
pub trait ExtensionPoint: 'static {
    /// The callout interface carriers implement for this point.
    type Callout: ?Sized + Send + Sync;

    /// Human-readable name used in logs.
    const NAME: &'static str;

    /// The registered callouts for this point, in registration order.
    fn table(tables: &CalloutTables) -> &[Arc<Self::Callout>];
}

// =============================================================================
// Authentication
// =============================================================================

/// Credentials presented by a user signing in.
#[derive(Clone)]
pub struct AuthenticationRequest {
    /// Login name.
    pub login: String,
    /// Secret; never logged.
    pub secret: String,
}

impl AuthenticationRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for AuthenticationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationRequest")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A user accepted by an authentication callout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// The user's identifier.
    pub id: UserId,
    /// The user's login name.
    pub login: String,
}

/// Callout interface for external authentication providers.
pub trait AuthenticationCallout: Send + Sync {
    /// Verify the credentials, returning the user on success.
    fn authenticate(&self, request: &AuthenticationRequest) -> Option<AuthenticatedUser>;
}

/// Extension point consulted when a user signs in.
///
/// Exactly one provider is expected to answer.
pub struct Authentication;

impl ExtensionPoint for Authentication {
    type Callout = dyn AuthenticationCallout;
    const NAME: &'static str = "authentication";

    fn table(tables: &CalloutTables) -> &[Arc<Self::Callout>] {
        &tables.authentication
    }
}

// =============================================================================
// BeforeForward
// =============================================================================

/// Callout interface observing every command sent to an agent.
pub trait BeforeForwardCallout: Send + Sync {
    /// Called before `command` is forwarded through the agent at `endpoint`.
    fn on_before_forward(&self, endpoint: &AgentEndpoint, command: &str);
}

/// Extension point fired before each command is forwarded to an agent.
///
/// Every registered observer is invoked.
pub struct BeforeForward;

impl ExtensionPoint for BeforeForward {
    type Callout = dyn BeforeForwardCallout;
    const NAME: &'static str = "before_forward";

    fn table(tables: &CalloutTables) -> &[Arc<Self::Callout>] {
        &tables.before_forward
    }
}
