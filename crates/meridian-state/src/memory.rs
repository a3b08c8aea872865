use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LockError;
use crate::traits::{LockBackend, LockOps};
use crate::types::LockGuard;

/// In-process lock table.
///
/// Clones share the same table, so every worker task handed a clone contends
/// on the same names.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    locks: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, resource: &str) -> bool {
        self.locks.lock().await.contains_key(resource)
    }
}

#[async_trait]
impl LockOps for MemoryLock {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource) {
            Some(holder) if holder == token => {
                locks.remove(resource);
                Ok(())
            }
            Some(_) => Err(LockError::HeldElsewhere(resource.to_owned())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLock {
    async fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>, LockError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(resource) {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(resource.to_owned(), token.clone());
        drop(locks);

        Ok(Some(LockGuard::new(
            resource.to_owned(),
            token,
            Arc::new(self.clone()) as Arc<dyn LockOps>,
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn lock_basic_operations() {
        let lock = MemoryLock::new();

        let guard = lock.try_acquire("resource1").await.unwrap().unwrap();
        assert!(lock.try_acquire("resource1").await.unwrap().is_none());
        assert!(lock.try_acquire("resource2").await.unwrap().is_some());

        guard.release().await.unwrap();

        assert!(lock.try_acquire("resource1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_guard_releases() {
        let lock = MemoryLock::new();

        {
            let _guard = lock.try_acquire("resource1").await.unwrap().unwrap();
            assert!(lock.is_held("resource1").await);
        }

        for _ in 0..50 {
            if !lock.is_held("resource1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!lock.is_held("resource1").await);
    }

    #[tokio::test]
    async fn release_unheld_is_noop() {
        let lock = MemoryLock::new();
        lock.release("nobody", "no-token").await.unwrap();
    }

    #[tokio::test]
    async fn release_with_foreign_token_is_refused() {
        let lock = MemoryLock::new();
        let guard = lock.try_acquire("resource1").await.unwrap().unwrap();

        let err = lock.release("resource1", "someone-else").await.unwrap_err();
        assert!(matches!(err, LockError::HeldElsewhere(_)));
        assert!(lock.is_held("resource1").await);

        guard.release().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_acquirers_have_one_winner() {
        let lock = MemoryLock::new();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = lock.clone();
                tokio::spawn(async move { lock.try_acquire("contended").await.unwrap() })
            })
            .collect();

        let mut guards = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap() {
                guards.push(guard);
            }
        }

        assert_eq!(guards.len(), 1);
    }
}
