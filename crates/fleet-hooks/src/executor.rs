//! Dispatch of extension points to registered carriers.

use std::sync::Arc;

use crate::carrier::CalloutCarrier;
use crate::error::{HookError, Result};
use crate::points::{AuthenticationCallout, BeforeForwardCallout, ExtensionPoint};

/// Per-extension-point callout tables, filled at registration time.
#[derive(Default)]
pub struct CalloutTables {
    pub(crate) authentication: Vec<Arc<dyn AuthenticationCallout>>,
    pub(crate) before_forward: Vec<Arc<dyn BeforeForwardCallout>>,
}

/// Holds registered carriers and dispatches extension points to them.
///
/// Three aggregation strategies are offered:
///
/// - [`call_sequential`](Self::call_sequential): every callout, results collected
/// - [`call_single`](Self::call_single): only the first callout
/// - [`call_until_success`](Self::call_until_success): stop at the first non-default result
#[derive(Default)]
pub struct HookExecutor {
    carriers: Vec<Arc<dyn CalloutCarrier>>,
    tables: CalloutTables,
}

impl HookExecutor {
    /// Create an executor with no carriers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a carrier, filing its callouts into the matching tables.
    pub fn register(&mut self, carrier: Arc<dyn CalloutCarrier>) {
        let callouts = Arc::clone(&carrier).callouts();
        if callouts.is_empty() {
            tracing::warn!(
                carrier = carrier.name(),
                "Carrier implements no known extension point"
            );
        }

        if let Some(callout) = callouts.authentication {
            self.tables.authentication.push(callout);
        }
        if let Some(callout) = callouts.before_forward {
            self.tables.before_forward.push(callout);
        }

        tracing::debug!(carrier = carrier.name(), "Registered callout carrier");
        self.carriers.push(carrier);
    }

    /// Number of registered carriers.
    #[must_use]
    pub fn carrier_count(&self) -> usize {
        self.carriers.len()
    }

    /// Whether any carrier implements extension point `P`.
    #[must_use]
    pub fn has_registered<P: ExtensionPoint>(&self) -> bool {
        !P::table(&self.tables).is_empty()
    }

    /// Invoke every callout for `P` in registration order and collect the results.
    pub fn call_sequential<P, T, F>(&self, mut call: F) -> Vec<T>
    where
        P: ExtensionPoint,
        F: FnMut(&P::Callout) -> T,
    {
        P::table(&self.tables)
            .iter()
            .map(|callout| call(callout.as_ref()))
            .collect()
    }

    /// Invoke only the first callout for `P`.
    ///
    /// Returns `None` when nothing is registered. Logs a warning when more
    /// than one callout is registered, since only the first is consulted.
    pub fn call_single<P, T, F>(&self, call: F) -> Option<T>
    where
        P: ExtensionPoint,
        F: FnOnce(&P::Callout) -> T,
    {
        let table = P::table(&self.tables);
        if table.len() > 1 {
            tracing::warn!(
                extension_point = P::NAME,
                registered = table.len(),
                "There are many registered callout carriers but expected a single one"
            );
        }
        table.first().map(|callout| call(callout.as_ref()))
    }

    /// Invoke callouts for `P` in order until one returns a non-default value.
    ///
    /// Later callouts are not invoked. Returns `T::default()` if every
    /// callout does.
    pub fn call_until_success<P, T, F>(&self, mut call: F) -> T
    where
        P: ExtensionPoint,
        T: Default + PartialEq,
        F: FnMut(&P::Callout) -> T,
    {
        let empty = T::default();
        for callout in P::table(&self.tables) {
            let output = call(callout.as_ref());
            if output != empty {
                return output;
            }
        }
        empty
    }

    /// Close every carrier exactly once and clear all tables.
    ///
    /// All carriers are closed even if some fail.
    ///
    /// # Errors
    ///
    /// Returns `HookError::Shutdown` listing every carrier that failed to close.
    pub fn unregister_all(&mut self) -> Result<()> {
        self.tables = CalloutTables::default();

        let failures: Vec<HookError> = self
            .carriers
            .drain(..)
            .filter_map(|carrier| {
                carrier.close().err().map(|reason| {
                    tracing::error!(
                        carrier = carrier.name(),
                        reason = %reason,
                        "Failed to close callout carrier"
                    );
                    HookError::Close {
                        carrier: carrier.name().to_string(),
                        reason,
                    }
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookError::Shutdown(failures))
        }
    }
}
