use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds sent to clients in an `error` message before the
/// connection is closed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The client sent a message that could not be parsed.
    InvalidMessage,
    InvalidConnectionRequest,
    /// The base cookie is malformed or ahead of the server.
    InvalidConnectionRequestBaseCookie,
    /// Protocol version below the supported minimum.
    VersionNotSupported,
    /// The client's schema version is outside the supported range.
    SchemaVersionNotSupported,
    ClientNotFound,
    /// The client group's syncer failed; reconnecting re-hydrates.
    Internal,
    /// The server is draining this client group.
    Rebalance,
    /// Upstream temporarily unavailable.
    Unavailable,
}

impl ErrorKind {
    /// Whether a client should reconnect (with backoff) after receiving
    /// this kind, as opposed to requiring an application update.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Internal | ErrorKind::Rebalance | ErrorKind::Unavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
