use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LockError;
use crate::traits::LockOps;

/// Proof of holding a named lock.
pub struct LockGuard {
    resource: String,
    token: String,
    ops: Arc<dyn LockOps>,
    released: AtomicBool,
}

impl LockGuard {
    pub fn new(resource: String, token: String, ops: Arc<dyn LockOps>) -> Self {
        Self {
            resource,
            token,
            ops,
            released: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(self) -> Result<(), LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ops.release(&self.resource, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }

        let ops = Arc::clone(&self.ops);
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ops.release(&resource, &token).await {
                        tracing::warn!(
                            resource = %resource,
                            error = %e,
                            "Failed to release lock on drop"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    resource = %resource,
                    "Lock guard dropped outside a runtime; lock left to its backend"
                );
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
