//! Server error types.

use relay_core::{classify_io, ErrorKind, RouterError, Severity};
use std::net::SocketAddr;

/// Errors raised while starting, running or stopping the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A listener could not be created or bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The configuration cannot produce a working server
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Lifecycle misuse or any other internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for RouterError {
    fn from(err: ServerError) -> Self {
        let (kind, severity) = match &err {
            ServerError::Bind { source, .. } => (classify_io(source.kind()), Severity::Critical),
            ServerError::Config(_) => (ErrorKind::Validation, Severity::High),
            ServerError::Internal(_) => (ErrorKind::Unknown, Severity::High),
        };
        // Startup failures are never retried.
        RouterError::new(kind, err.to_string())
            .with_severity(severity)
            .with_retryable(false)
            .with_cause(err)
    }
}
