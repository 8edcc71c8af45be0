use thiserror::Error;

/// Errors produced by the WAMP channel layer.
#[derive(Debug, Error)]
pub enum WampError {
    /// Key derivation failed; the authentication attempt must be abandoned.
    #[error("could not compute credentials: {0}")]
    Derivation(String),

    /// `connect()` failed to establish the underlying connection.
    #[error("could not connect: {0}")]
    Connection(String),

    /// An established connection went away unexpectedly.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Out-of-contract usage, e.g. sending while not connected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("a handler is already attached to this transport")]
    HandlerConflict,

    /// A pending operation was abandoned before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type WampResult<T> = Result<T, WampError>;
