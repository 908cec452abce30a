//! Error types for the UART multiplexer

use thiserror::Error;

/// Errors reported by a framing engine implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not allocate a session or channel object
    #[error("framing engine out of memory")]
    OutOfMemory,

    /// A channel with this identifier already exists on the session
    #[error("channel {0} already exists")]
    ChannelExists(u8),

    /// The channel is not connected to the peer
    #[error("channel {0} not connected")]
    NotConnected(u8),

    /// Sending a frame failed
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors that can occur in the multiplexer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Argument does not name a valid object
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup failed or a fixed pool is exhausted
    #[error("not found: {0}")]
    NotFound(String),

    /// Framing engine session or channel creation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Operation is not implemented by muxed UARTs
    #[error("operation not supported by muxed UART")]
    NotSupported,

    /// Device is not attached or its link is not ready
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// Channel is already bound and may not be attached again
    #[error("channel {channel} already attached to {link}")]
    AlreadyAttached {
        /// Name of the virtual channel
        channel: String,
        /// Name of the physical link it is bound to
        link: String,
    },

    /// Framing engine error other than allocation failure
    #[error("framing engine error: {0}")]
    Engine(EngineError),

    /// Host serial link error
    #[error("serial link error: {0}")]
    Link(String),
}

impl From<EngineError> for MuxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OutOfMemory => MuxError::OutOfMemory(err.to_string()),
            other => MuxError::Engine(other),
        }
    }
}

impl From<serialport::Error> for MuxError {
    fn from(err: serialport::Error) -> Self {
        MuxError::Link(err.to_string())
    }
}
