//! Configuration module interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Update;

/// A daemon-family-specific translator of configuration changes.
///
/// Modules stage updates into a context through their own `begin_*` and
/// `apply_*` methods and are called back by the manager to commit them.
#[async_trait]
pub trait ConfigModule: Send + Sync {
    /// Name updates are tagged with.
    fn name(&self) -> &'static str;

    /// Send one staged update to its daemons.
    ///
    /// The update may carry live or snapshot targets; both must be handled.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownOperation` for operations the module
    /// does not implement, or the first delivery or daemon error.
    async fn commit_update(&self, update: &Update) -> Result<()>;
}
