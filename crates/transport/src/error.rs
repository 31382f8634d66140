use thiserror::Error;

/// Errors raised by transports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation needed a connection before `connect` was called.
    #[error("not connected")]
    NotConnected,

    /// The endpoint URL could not be understood.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A subscription control frame was malformed.
    #[error("invalid control frame: {0}")]
    InvalidControlFrame(String),

    /// `receive` was called with nothing to read.
    #[error("nothing to receive")]
    WouldBlock,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}
