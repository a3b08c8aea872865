//! PostgreSQL advisory lock backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LockError;
use crate::traits::{LockBackend, LockOps};
use crate::types::LockGuard;

const TRY_LOCK: &str = "SELECT pg_try_advisory_lock(hashtextextended($1, 0))";
const UNLOCK: &str = "SELECT pg_advisory_unlock(hashtextextended($1, 0))";

/// Longest wait for a pooled session before an acquire attempt gives up.
const DEFAULT_ACQUIRE_WAIT: Duration = Duration::from_millis(250);

struct Held {
    token: String,
    conn: PoolConnection<Postgres>,
}

/// Advisory locks held on dedicated pooled sessions.
///
/// Each held lock pins one connection until release, because PostgreSQL
/// session locks belong to the session that took them. If the worker dies the
/// session closes and the server drops its locks.
#[derive(Clone)]
pub struct PostgresLock {
    pool: PgPool,
    held: Arc<Mutex<HashMap<String, Held>>>,
    acquire_wait: Duration,
}

impl PostgresLock {
    /// Connect a dedicated pool for lock sessions.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, LockError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            held: Arc::new(Mutex::new(HashMap::new())),
            acquire_wait: DEFAULT_ACQUIRE_WAIT,
        }
    }

    /// Bound the wait for a free session. An exhausted pool then reports a
    /// connection error instead of stalling the tick.
    #[must_use]
    pub fn with_acquire_wait(mut self, wait: Duration) -> Self {
        self.acquire_wait = wait;
        self
    }
}

#[async_trait]
impl LockOps for PostgresLock {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        let entry = match held.get(resource) {
            Some(entry) if entry.token == token => held.remove(resource),
            Some(_) => return Err(LockError::HeldElsewhere(resource.to_owned())),
            None => return Ok(()),
        };
        drop(held);

        let Some(Held { mut conn, .. }) = entry else {
            return Ok(());
        };

        match sqlx::query_scalar::<_, bool>(UNLOCK)
            .bind(resource)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(resource = %resource, "advisory lock was not held by its session");
                Ok(())
            }
            Err(e) => {
                // Closing the session is the only way left to drop the lock.
                let _ = conn.close().await;
                Err(LockError::Backend(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl LockBackend for PostgresLock {
    async fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>, LockError> {
        if self.held.lock().await.contains_key(resource) {
            return Ok(None);
        }

        let mut conn = match tokio::time::timeout(self.acquire_wait, self.pool.acquire()).await {
            Ok(conn) => conn.map_err(|e| LockError::Connection(e.to_string()))?,
            Err(_) => {
                return Err(LockError::Connection(format!(
                    "no lock session free within {}ms for {resource}",
                    self.acquire_wait.as_millis()
                )))
            }
        };

        let acquired = sqlx::query_scalar::<_, bool>(TRY_LOCK)
            .bind(resource)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if !acquired {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        self.held.lock().await.insert(
            resource.to_owned(),
            Held {
                token: token.clone(),
                conn,
            },
        );

        Ok(Some(LockGuard::new(
            resource.to_owned(),
            token,
            Arc::new(self.clone()) as Arc<dyn LockOps>,
        )))
    }
}

impl std::fmt::Debug for PostgresLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLock")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}
