use crate::types::{ConnectionState, OpKind};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("session already has a connected peer")]
    AlreadyConnected,

    #[error("memory registration failed: {0}")]
    Registration(String),

    #[error("no established connection (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("{op} failed: {reason}")]
    Operation { op: OpKind, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fabric error: {message}")]
    Fabric {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create a `Connect` error for `addr`.
    pub fn connect(addr: impl ToString, reason: impl Into<String>) -> Self {
        Self::Connect {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an `Operation` error for a single failed data-path operation.
    pub fn operation(op: OpKind, reason: impl Into<String>) -> Self {
        Self::Operation {
            op,
            reason: reason.into(),
        }
    }

    /// Create a `Fabric` error with just a message.
    pub fn fabric(msg: impl Into<String>) -> Self {
        Self::Fabric {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Fabric` error with a message and a source error.
    pub fn fabric_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fabric {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// I/O failure on an established stream. Peer resets and EOF count as a
    /// lost connection.
    pub(crate) fn transport_io(context: &str, e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => TransportError::ConnectionLost(format!("{context}: {e}")),
            _ => TransportError::Io(e),
        }
    }

    /// The connection this error came from is gone and will not recover.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::ConnectionClosed
        )
    }
}
