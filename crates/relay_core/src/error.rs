//! Typed error taxonomy shared by every layer of the relay.
//!
//! Failures are tagged with an [`ErrorKind`] where they originate, so
//! classification is a lookup on the kind rather than an inspection of the
//! error text. Conversions from foreign error types (`std::io::Error`,
//! `tokio::time::error::Elapsed`, `serde_json::Error`) perform that tagging
//! once, at the boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::SystemTime;

use crate::session::Protocol;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Processing,
    Resource,
    Plugin,
    Network,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::Processing,
        ErrorKind::Resource,
        ErrorKind::Plugin,
        ErrorKind::Network,
        ErrorKind::Validation,
        ErrorKind::Unknown,
    ];

    /// Severity assigned when the origin does not override it.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::Connection | ErrorKind::Network | ErrorKind::Resource => Severity::High,
            ErrorKind::Timeout | ErrorKind::Processing | ErrorKind::Plugin | ErrorKind::Unknown => {
                Severity::Medium
            }
            ErrorKind::Validation => Severity::Low,
        }
    }

    /// Whether failures of this kind are transient by nature.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Network
        )
    }

    /// Lowercase label used for metrics and structured log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Processing => "processing",
            ErrorKind::Resource => "resource",
            ErrorKind::Plugin => "plugin",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "Connection",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Processing => "Processing",
            ErrorKind::Resource => "Resource",
            ErrorKind::Plugin => "Plugin",
            ErrorKind::Network => "Network",
            ErrorKind::Validation => "Validation",
            ErrorKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// How bad a failure is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where a failure happened.
///
/// Threaded explicitly through every call boundary instead of being kept in
/// ambient task-local state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub session_id: Option<String>,
    pub protocol: Option<Protocol>,
    pub component: Option<String>,
    pub operation: Option<String>,
    pub extra: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(session_id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            session_id: Some(session_id.into()),
            protocol: Some(protocol),
            ..Self::default()
        }
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Fill fields that are still empty from `other`. Existing values win.
    pub fn merge(&mut self, other: &ErrorContext) {
        if self.session_id.is_none() {
            self.session_id = other.session_id.clone();
        }
        if self.protocol.is_none() {
            self.protocol = other.protocol;
        }
        if self.component.is_none() {
            self.component = other.component.clone();
        }
        if self.operation.is_none() {
            self.operation = other.operation.clone();
        }
        for (key, value) in &other.extra {
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// The typed error every relay component reports.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RouterError {
    pub message: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub context: ErrorContext,
    pub retryable: bool,
    pub timestamp: SystemTime,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RouterError {
    /// Build an error whose severity and retryability follow from `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            severity: kind.default_severity(),
            context: ErrorContext::default(),
            retryable: kind.is_transient(),
            timestamp: SystemTime::now(),
            cause: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn plugin(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Plugin, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach context. Fields already present on the error are kept.
    pub fn with_context(mut self, context: &ErrorContext) -> Self {
        self.context.merge(context);
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Deterministic mapping from I/O failure categories to relay error kinds.
pub fn classify_io(kind: io::ErrorKind) -> ErrorKind {
    use io::ErrorKind as Io;

    match kind {
        Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::AddrInUse => ErrorKind::Connection,
        Io::AddrNotAvailable | Io::HostUnreachable | Io::NetworkUnreachable | Io::NetworkDown => {
            ErrorKind::Network
        }
        Io::InvalidInput | Io::InvalidData | Io::UnexpectedEof => ErrorKind::Validation,
        Io::OutOfMemory => ErrorKind::Resource,
        _ => ErrorKind::Unknown,
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> Self {
        let kind = classify_io(err.kind());
        RouterError::new(kind, err.to_string()).with_cause(err)
    }
}

impl From<tokio::time::error::Elapsed> for RouterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RouterError::timeout("operation timed out").with_cause(err)
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::validation(format!("malformed input: {err}")).with_cause(err)
    }
}

pub type RelayResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_defaults() {
        let err = RouterError::timeout("slow peer");
        assert_eq!(err.severity, Severity::Medium);
        assert!(err.retryable);

        let err = RouterError::connection("refused");
        assert_eq!(err.severity, Severity::High);
        assert!(err.retryable);

        let err = RouterError::plugin("boom");
        assert_eq!(err.severity, Severity::Medium);
        assert!(!err.retryable);

        let err = RouterError::validation("bad frame");
        assert_eq!(err.severity, Severity::Low);
        assert!(!err.retryable);

        let err = RouterError::unknown("???");
        assert_eq!(err.severity, Severity::Medium);
        assert!(!err.retryable);
    }

    #[test]
    fn test_io_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(RouterError::from(refused).kind, ErrorKind::Connection);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "late");
        assert_eq!(RouterError::from(timed_out).kind, ErrorKind::Timeout);

        let unreachable = io::Error::new(io::ErrorKind::NetworkUnreachable, "gone");
        let err = RouterError::from(unreachable);
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);

        let garbage = io::Error::new(io::ErrorKind::InvalidData, "garbage");
        assert_eq!(RouterError::from(garbage).kind, ErrorKind::Validation);

        let other = io::Error::other("mystery");
        assert_eq!(RouterError::from(other).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_context_merge_keeps_existing_fields() {
        let err = RouterError::processing("stage failed")
            .with_context(&ErrorContext::new().component("pipeline"))
            .with_context(
                &ErrorContext::for_session("abc", Protocol::Tcp)
                    .component("router")
                    .with_extra("stage", "2"),
            );

        assert_eq!(err.context.component.as_deref(), Some("pipeline"));
        assert_eq!(err.context.session_id.as_deref(), Some("abc"));
        assert_eq!(err.context.protocol, Some(Protocol::Tcp));
        assert_eq!(err.context.extra.get("stage").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        use std::error::Error;

        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err = RouterError::from(io_err);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Connection error: pipe closed");
    }
}
