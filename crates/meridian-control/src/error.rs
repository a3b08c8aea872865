//! Error types for meridian-control.

use meridian_state::LockError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Advisory lock backend error.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Cloud fleet provider error.
    #[error("fleet error: {0}")]
    Fleet(String),

    /// Notification delivery error.
    #[error("notification error: {0}")]
    Notification(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind, e.g. `cluster`.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Stored state contradicts what the controller expects.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a fleet provider error.
    #[must_use]
    pub fn fleet(msg: impl Into<String>) -> Self {
        Self::Fleet(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an invariant violation error.
    #[must_use]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a later tick can be expected to succeed without intervention.
    ///
    /// Infrastructure failures are transient. Missing records and violated
    /// invariants need an operator.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(_) | Self::Fleet(_) | Self::Http(_) | Self::Notification(_) => true,
            Self::Lock(e) => e.is_transient(),
            Self::NotFound { .. }
            | Self::InvariantViolation(_)
            | Self::Config(_)
            | Self::Serialisation(_)
            | Self::Internal(_) => false,
        }
    }
}
