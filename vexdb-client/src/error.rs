//! Client error types.

use thiserror::Error;
use vexdb_protocol::ProtocolError;

/// Client errors.
///
/// Every variant is `Clone`: a failed connection stores its terminal error
/// once and resolves every current and future waiter with the same value.
/// I/O errors are folded into [`ClientError::Network`] for the same reason
/// (`std::io::Error` is not `Clone`).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// A connect, login, or per-request deadline fired. The payload names
    /// the phase.
    #[error("{0} timeout")]
    Timeout(&'static str),

    /// The caller's deadline expired before the request was submitted.
    #[error("request canceled")]
    Canceled,

    /// An argument kind the wire protocol does not accept from clients.
    #[error("unsupported argument kind: {0}")]
    InvalidArgument(&'static str),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("network error: {0}")]
    Network(String),

    /// The peer closed the socket, or the connection was finalized.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid connection uri: {0}")]
    InvalidUri(String),

    /// A well-formed reply carrying a non-OK status. Status and message
    /// propagate from the server verbatim.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}

impl ClientError {
    /// Whether this error is fatal to the connection, as opposed to local
    /// to a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol(_) | ClientError::Network(_) | ClientError::ConnectionClosed
        )
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ClientError::ConnectionClosed
        } else {
            ClientError::Network(err.to_string())
        }
    }
}
