use std::sync::Arc;

use crate::config::LockConfig;
use crate::error::StateError;
use crate::traits::LockBackend;

#[cfg(feature = "memory")]
use crate::memory::MemoryLock;

#[cfg(feature = "postgres")]
use crate::postgres::PostgresLock;

/// Build the lock backend named by `config`.
pub async fn lock_backend_from_config(
    config: &LockConfig,
) -> Result<Arc<dyn LockBackend>, StateError> {
    match config {
        #[cfg(feature = "memory")]
        LockConfig::Memory => Ok(Arc::new(MemoryLock::new())),

        #[cfg(feature = "postgres")]
        LockConfig::Postgres {
            url,
            max_connections,
        } => {
            let lock = PostgresLock::new(url, *max_connections)
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;
            Ok(Arc::new(lock))
        }

        #[allow(unreachable_patterns)]
        _ => Err(StateError::UnsupportedBackend(
            "No suitable lock backend enabled".to_string(),
        )),
    }
}
