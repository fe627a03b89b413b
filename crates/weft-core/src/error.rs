//! The fabric-wide error taxonomy.
//!
//! Handlers can receive the same error in several places (session handler,
//! per-operation completions), so the type is cheap to clone and compare.
//! OS-level failures keep their rendered message rather than the source
//! `io::Error`, which is not `Clone`.

use weft_wire::WireError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation aborted by the caller or a supervisor.
    #[error("operation canceled")]
    Canceled,
    /// Deadline elapsed before completion.
    #[error("deadline elapsed")]
    Timeout,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("wrong object type")]
    WrongObjectType,
    #[error("object still in use")]
    ObjectStillUsed,
    /// The targeted entity is busy with an operation that excludes this one.
    #[error("operation already in progress")]
    Busy,
    #[error("already assigned")]
    AlreadyAssigned,
    /// A state precondition does not hold (e.g. nothing is subscribed).
    #[error("not ready")]
    NotReady,
    /// The caller-provided buffer cannot hold the payload.  The message
    /// still counts as received.
    #[error("buffer too small ({needed} bytes needed)")]
    BufferTooSmall { needed: usize },
    #[error("could not open socket: {0}")]
    OpenSocketFailed(String),
    #[error("could not bind socket: {0}")]
    BindSocketFailed(String),
    #[error("could not set socket option: {0}")]
    SetSocketOptionFailed(String),
    /// The peer announced a body over the configured maximum.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    /// A framed message could not be decoded; the session is terminated.
    #[error("could not deserialize message: {0}")]
    DeserializeFailed(#[from] WireError),
    #[error("connection to own branch rejected")]
    LoopbackConnection,
    #[error("network password mismatch")]
    PasswordMismatch,
    #[error("duplicate connection to the same branch rejected")]
    DuplicateConnection,
    /// Synchronous broadcast back-pressure signal.
    #[error("transmit queue full")]
    TxQueueFull,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn from_io(err: &std::io::Error) -> Error {
        Error::ConnectionClosed(err.to_string())
    }
}
