use async_trait::async_trait;

use crate::error::LockError;
use crate::types::LockGuard;

#[async_trait]
pub trait LockBackend: LockOps {
    /// Take `resource` if nobody else holds it.
    ///
    /// Returns `Ok(None)` immediately when the lock is held elsewhere; this
    /// call never waits for the current holder.
    async fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>, LockError>;
}

#[async_trait]
pub trait LockOps: Send + Sync {
    /// Release `resource` if `token` is the current holder.
    ///
    /// Releasing a resource nobody holds is a no-op. Releasing one held under
    /// a different token fails with [`LockError::HeldElsewhere`].
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError>;
}
