//! Error types shared by the order, inventory and sync layers.

use thiserror::Error;

/// Errors raised by the local (SQLite-backed) side of the engine.
#[derive(Debug, Error)]
pub enum PosError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("order failed: {0}")]
    OrderFailed(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A versioned row changed between read and write.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential store error: {0}")]
    Credential(String),
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PosError::LockPoisoned(err.to_string())
    }
}

pub type PosResult<T> = Result<T, PosError>;

/// Failure of a single remote call made by the sync coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout, refused connection, unreachable host. Never counted against
    /// the retry ceiling.
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid sync payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_network_class() {
        assert!(RemoteError::Network("connection refused".into()).is_network());
        assert!(!RemoteError::Rejected {
            status: 503,
            message: "maintenance".into()
        }
        .is_network());
        assert!(!RemoteError::InvalidPayload("bad json".into()).is_network());
    }

    #[test]
    fn test_poison_error_maps_to_lock_poisoned() {
        let lock = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: PosError = lock.lock().unwrap_err().into();
        assert!(matches!(err, PosError::LockPoisoned(_)));
    }
}
