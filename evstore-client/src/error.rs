//! Client error types.

use evstore_protocol::{ProtocolError, TcpCommand};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
///
/// Cloneable so that one failure can resolve every handle of a shared task.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection is not active")]
    NotActive,

    #[error("connection is already active")]
    AlreadyActive,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("cannot establish connection: {0}")]
    CannotEstablishConnection(String),

    #[error("timed out")]
    Timeout,

    #[error("operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("retries limit reached for {operation} after {retries} retries")]
    RetriesLimitReached { operation: String, retries: i32 },

    #[error(
        "wrong expected version on stream '{stream}': expected {expected}, current {current:?}"
    )]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        current: Option<i64>,
    },

    #[error("stream '{0}' is deleted")]
    StreamDeleted(String),

    #[error("invalid transaction")]
    InvalidTransaction,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("command not expected: expected {expected}, got {actual}")]
    CommandNotExpected {
        expected: TcpCommand,
        actual: TcpCommand,
    },

    #[error("no result received")]
    NoResult,

    #[error("result already set")]
    AlreadyCompleted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("persistent subscription error: {0}")]
    PersistentSubscription(String),

    #[error("event handler failed: {0}")]
    EventHandler(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<prost::DecodeError> for ClientError {
    fn from(err: prost::DecodeError) -> Self {
        ClientError::Protocol(ProtocolError::Decode(err))
    }
}

impl ClientError {
    /// Returns whether repeating the failed work may succeed.
    ///
    /// An exhausted retry budget is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::OperationTimedOut(_)
                | ClientError::ConnectionClosed(_)
        )
    }

    pub(crate) fn connection_closed(reason: impl Into<String>) -> Self {
        ClientError::ConnectionClosed(reason.into())
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "event handler panicked".to_string(),
            },
        };
        ClientError::EventHandler(message)
    }
}

/// Runs a user event handler, turning a panic into [`ClientError::EventHandler`].
pub(crate) fn run_handler(
    handler: impl FnOnce() -> Result<(), ClientError>,
) -> Result<(), ClientError> {
    panic::catch_unwind(AssertUnwindSafe(handler)).unwrap_or_else(|payload| {
        tracing::warn!("Event handler panicked");
        Err(ClientError::from_panic(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(ClientError::from(io).is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::connection_closed("bye").is_retryable());

        assert!(!ClientError::StreamDeleted("s".into()).is_retryable());
        let exhausted = ClientError::RetriesLimitReached {
            operation: "append".into(),
            retries: 3,
        };
        assert!(!exhausted.is_retryable());
        assert!(!ClientError::AccessDenied("s".into()).is_retryable());
        assert!(!ClientError::InvalidTransaction.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::WrongExpectedVersion {
            stream: "orders".into(),
            expected: 3,
            current: Some(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains('3'));

        let err = ClientError::CommandNotExpected {
            expected: TcpCommand::WriteEventsCompleted,
            actual: TcpCommand::ReadEventCompleted,
        };
        assert!(err.to_string().contains("WriteEventsCompleted"));

        let err = ClientError::RetriesLimitReached {
            operation: "append".into(),
            retries: 10,
        };
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_handler_panic_becomes_error() {
        let result = run_handler(|| panic!("bad event {}", 7));
        match result {
            Err(ClientError::EventHandler(message)) => assert_eq!(message, "bad event 7"),
            other => panic!("unexpected {:?}", other),
        }

        let result = run_handler(|| panic!("static message"));
        assert!(matches!(result, Err(ClientError::EventHandler(m)) if m == "static message"));

        assert!(run_handler(|| Ok(())).is_ok());
        assert!(matches!(
            run_handler(|| Err(ClientError::Timeout)),
            Err(ClientError::Timeout)
        ));
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = ClientError::from(std::io::Error::other("boom"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
