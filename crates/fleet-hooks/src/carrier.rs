//! Carrier registration interface.

use std::sync::Arc;

use crate::points::{AuthenticationCallout, BeforeForwardCallout};

/// A loaded extension that implements one or more callout interfaces.
pub trait CalloutCarrier: Send + Sync {
    /// Name used in logs and shutdown errors.
    fn name(&self) -> &str;

    /// Advertise the callout interfaces this carrier implements.
    ///
    /// Called once, at registration.
    fn callouts(self: Arc<Self>) -> Callouts;

    /// Release resources held by the carrier.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; the executor aggregates these.
    fn close(&self) -> Result<(), String> {
        Ok(())
    }
}

/// The set of callout interfaces a carrier implements.
#[derive(Default)]
pub struct Callouts {
    pub(crate) authentication: Option<Arc<dyn AuthenticationCallout>>,
    pub(crate) before_forward: Option<Arc<dyn BeforeForwardCallout>>,
}

impl Callouts {
    /// Advertise an authentication callout.
    #[must_use]
    pub fn with_authentication(mut self, callout: Arc<dyn AuthenticationCallout>) -> Self {
        self.authentication = Some(callout);
        self
    }

    /// Advertise a before-forward callout.
    #[must_use]
    pub fn with_before_forward(mut self, callout: Arc<dyn BeforeForwardCallout>) -> Self {
        self.before_forward = Some(callout);
        self
    }

    /// Whether no interface is advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authentication.is_none() && self.before_forward.is_none()
    }
}
