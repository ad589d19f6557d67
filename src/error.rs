//! Error taxonomy
//!
//! Every fallible operation in the crate returns one of these variants so
//! callers can pattern-match instead of string-matching messages. Transport
//! errors are stored as strings to keep the enum `Clone`: concurrent load
//! requests for the same model all receive a copy of the one real outcome.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ManagerError>;

/// All error conditions surfaced by the model manager
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// VRAM/RAM introspection failed. Never silently substituted with a
    /// guess: a wrong value here risks an out-of-memory crash during load.
    #[error("resource query failed: {0}")]
    ResourceUnavailable(String),

    /// Model id/name or conversation thread could not be resolved
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate download request or target file already present
    #[error("conflict: {0}")]
    Conflict(String),

    /// Download returned HTTP 401: the repository is gated
    #[error("download requires an access token")]
    TokenRequired,

    /// Download returned HTTP 403: credentials were rejected
    #[error("access to this repository is forbidden")]
    AccessForbidden,

    /// User- or signal-initiated abort of a download or generation
    #[error("operation cancelled")]
    Cancelled,

    /// Native engine failure during load or generation
    #[error("engine error: {0}")]
    Engine(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("http error: {0}")]
    Http(String),
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for ManagerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_clone() {
        let err = ManagerError::Engine("load failed".to_string());
        let copy = err.clone();
        assert!(matches!(copy, ManagerError::Engine(msg) if msg == "load failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ManagerError = io.into();
        assert!(matches!(err, ManagerError::Io(_)));
    }
}
