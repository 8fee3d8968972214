use crate::config::ConfigError;
use crate::state::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors so callers can branch without matching every variant.
///
/// This is a lightweight, copyable view of [`Error`], also recorded as the
/// `last_error` in [`Metrics`](crate::Metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level connect failure (DNS, refused, TLS, handshake)
    Dial,
    /// Server rejected the credential during the handshake
    AuthRejected,
    /// A receive, write or wait deadline expired
    Timeout,
    /// Inbound bytes were not a valid envelope
    MalformedPayload,
    /// Delivery queue is at capacity
    QueueFull,
    /// Operation attempted after `close()`
    Closed,
    /// Operation requires a connected client
    NotConnected,
    /// Caller cancelled a connect cycle
    Cancelled,
    /// Established connection failed mid-session
    Transport,
    /// Caller-supplied input was rejected before reaching the wire
    InvalidInput,
}

/// Errors that can occur in ws-resilient-client
#[derive(Error, Debug)]
pub enum Error {
    /// Dial or handshake failed. `attempts` is filled in once retries are exhausted.
    #[error("Dial failed after {attempts} attempt(s): {reason}")]
    Dial { attempts: u32, reason: String },

    /// Handshake completed with a 401/403-equivalent response
    #[error("Authentication rejected by server (HTTP {status})")]
    AuthRejected { status: u16 },

    /// Deadline expired; the connection is still usable
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Inbound frame failed to decode as an envelope; the connection is still usable
    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// Delivery queue rejected an enqueue
    #[error("Delivery queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// Client has been closed
    #[error("Connection is closed")]
    Closed,

    /// Operation needs a connected client
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// Connect cycle cancelled by the caller
    #[error("Connect cancelled")]
    Cancelled,

    /// WebSocket protocol or I/O error on an established connection
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Peer closed the connection or keep-alive failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Outbound envelope failed validation
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Token cannot be carried on the upgrade request
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Dial { .. } => ErrorKind::Dial,
            Error::AuthRejected { .. } => ErrorKind::AuthRejected,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::Closed => ErrorKind::Closed,
            Error::NotConnected { .. } => ErrorKind::NotConnected,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::WebSocket(_) | Error::ConnectionLost(_) => ErrorKind::Transport,
            Error::InvalidEnvelope(_) | Error::InvalidCredential(_) | Error::Config(_) => {
                ErrorKind::InvalidInput
            }
        }
    }

    /// Whether the connection manager retries this failure on its own.
    ///
    /// Auth rejection is never retried: the same credential cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Dial | ErrorKind::Transport)
    }

    pub(crate) fn dial(reason: impl Into<String>) -> Self {
        Error::Dial {
            attempts: 0,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedPayload {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::dial("refused").kind(), ErrorKind::Dial);
        assert_eq!(Error::AuthRejected { status: 401 }.kind(), ErrorKind::AuthRejected);
        assert_eq!(Error::malformed("bad json").kind(), ErrorKind::MalformedPayload);
        assert_eq!(Error::QueueFull { capacity: 1 }.kind(), ErrorKind::QueueFull);
        assert_eq!(Error::ConnectionLost("eof".into()).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::dial("refused").is_retryable());
        assert!(Error::ConnectionLost("reset".into()).is_retryable());
        assert!(!Error::AuthRejected { status: 403 }.is_retryable());
        assert!(!Error::Closed.is_retryable());
        assert!(!Error::Timeout {
            operation: "receive",
            after: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = Error::Dial {
            attempts: 3,
            reason: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "Dial failed after 3 attempt(s): connection refused");
    }
}
