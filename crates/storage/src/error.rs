use time::OffsetDateTime;

/// Errors returned by an [`AuditLedger`](crate::AuditLedger) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A persisted entry could not be encoded or decoded.
    #[error("audit entry serialization error: {0}")]
    Serialization(String),

    /// A backend-specific failure (connection, I/O, constraint violation, etc.).
    #[error("audit backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Errors returned by a [`LockService`](crate::LockService) backend.
#[derive(Debug, thiserror::Error)]
pub enum LockServiceError {
    /// The key is held by another owner whose lease has not expired yet.
    #[error("lock '{key}' is held by '{current_owner}' until {expires_at}")]
    AlreadyOwned {
        key: String,
        current_owner: String,
        expires_at: OffsetDateTime,
    },

    /// An extension was requested by someone who does not hold the key.
    #[error("lock '{key}' is not owned by '{requesting_owner}' (current owner: {})", .current_owner.as_deref().unwrap_or("none"))]
    NotOwner {
        key: String,
        requesting_owner: String,
        current_owner: Option<String>,
    },

    /// A backend-specific failure.
    #[error("lock backend error: {0}")]
    Backend(String),
}
