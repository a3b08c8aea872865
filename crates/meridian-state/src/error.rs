use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lock held by another holder: {0}")]
    HeldElsewhere(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Whether retrying on a later tick can reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
