//! Error types for pg-http-proxy.

use thiserror::Error;

/// Result type for proxy operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field values, as received in an
/// ErrorResponse or NoticeResponse message.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Table name
    pub table: Option<String>,
}

impl ErrorFields {
    /// Preferred severity: the non-localized one when the server sent it.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pg-http-proxy.
#[derive(Debug, Error)]
pub enum Error {
    /// Clean error response from the backend. The connection that produced
    /// it has been drained to ReadyForQuery and remains usable.
    #[error("backend error: {0}")]
    Backend(ErrorFields),

    /// Protocol error (malformed frame, message not valid for the current
    /// phase). Unrecoverable for the owning connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on a backend socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TLS failure on the backend leg.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Connection is broken and cannot be reused.
    #[error("connection is broken")]
    ConnectionBroken,

    /// Per-request deadline elapsed while a query was executing.
    /// The connection it ran on is discarded.
    #[error("query timed out")]
    QueryTimeout,

    /// Per-request deadline elapsed while waiting for a pool slot.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The supervisor is not in the Ready state.
    #[error("service unavailable: {0}")]
    Unavailable(&'static str),

    /// Malformed client request (structural validation only).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the error leaves the backend connection in an
    /// unknown protocol state, so it must be discarded rather than pooled.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::ConnectionBroken
            | Error::Protocol(_)
            | Error::QueryTimeout
            | Error::Tls(_) => true,
            // FATAL and PANIC close the session on the server side.
            Error::Backend(fields) => {
                matches!(fields.severity(), Some("FATAL") | Some("PANIC"))
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a backend error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Backend(fields) => fields.code.as_deref(),
            _ => None,
        }
    }
}
