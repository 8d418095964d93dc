//! Shared, typed front-end to the hook executor.

use std::sync::Arc;

use fleet_core::AgentEndpoint;
use parking_lot::RwLock;

use crate::carrier::CalloutCarrier;
use crate::error::Result;
use crate::executor::HookExecutor;
use crate::points::{AuthenticatedUser, Authentication, AuthenticationRequest, BeforeForward};

/// Thread-safe hook manager shared by the control plane components.
///
/// Each extension point gets a helper that applies the aggregation strategy
/// that point expects.
#[derive(Default)]
pub struct HookManager {
    executor: RwLock<HookExecutor>,
}

impl HookManager {
    /// Create a manager with no carriers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a carrier.
    pub fn register(&self, carrier: Arc<dyn CalloutCarrier>) {
        self.executor.write().register(carrier);
    }

    /// Authenticate a user through the single authentication provider.
    ///
    /// Returns `None` if no provider is registered or the provider declines.
    #[must_use]
    pub fn authenticate(&self, request: &AuthenticationRequest) -> Option<AuthenticatedUser> {
        self.executor
            .read()
            .call_single::<Authentication, _, _>(|callout| callout.authenticate(request))
            .flatten()
    }

    /// Notify every observer that a command is about to be forwarded.
    pub fn on_before_forward(&self, endpoint: &AgentEndpoint, command: &str) {
        self.executor
            .read()
            .call_sequential::<BeforeForward, _, _>(|callout| {
                callout.on_before_forward(endpoint, command);
            });
    }

    /// Close and remove every carrier.
    ///
    /// # Errors
    ///
    /// Returns the aggregated close failures.
    pub fn shutdown(&self) -> Result<()> {
        self.executor.write().unregister_all()
    }
}
