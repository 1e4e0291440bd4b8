//! Error types for the digitizer pipeline.

use thiserror::Error;

/// Result type alias using the digitizer's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy kind of an [`Error`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ExternalService,
    Database,
    Connection,
    Serialization,
    Config,
    Internal,
}

/// Core error type for digitizer operations.
///
/// One variant per taxonomy kind; callers match exhaustively instead of
/// inspecting message text.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input. Surfaced to the caller and never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Missing work record, job, or dead letter entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the current state (e.g. deleting an active job)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A remote provider (recognition, translation, storage) failed.
    #[error("[{service}]: {message}")]
    ExternalService { service: String, message: String },

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Could not reach required infrastructure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an external-service failure.
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::ExternalService { .. } => ErrorKind::ExternalService,
            Error::Database(_) => ErrorKind::Database,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::ExternalService | ErrorKind::Database | ErrorKind::Connection => true,
            ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::Serialization
            | ErrorKind::Config
            | ErrorKind::Internal => false,
        }
    }

    /// Messages of this error and every source beneath it, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut out = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push(err.to_string());
            source = err.source();
        }
        out
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Error::Connection(e.to_string())
        } else {
            Error::external("http", e.to_string())
        }
    }
}
