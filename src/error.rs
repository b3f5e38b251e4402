use std::io;
use thiserror::Error;

/// Main error type for the server engine
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("listen error: {0}")]
    Listen(String),

    #[error("pump error: {0}")]
    Pump(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// Whether this error came from a rejected precondition rather than a
    /// failed operation. The caller's state is unchanged and the call can be
    /// retried once the precondition holds.
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(self, ServerError::Lifecycle(_))
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
