//! Error types for slednik.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for slednik operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slednik.
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection closed")]
    ConnectionClosed,

    // Registry errors
    #[error("device {0} is not connected")]
    NotConnected(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Protocol parsing and handling errors.
///
/// These are contained to a single frame: the dispatcher logs them and moves
/// on to the next frame, except for [`ProtocolError::FrameTooLarge`], which
/// closes the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too large: declared {declared} bytes (max {max})")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("truncated payload for opcode {opcode:#04x}: need {need} bytes, have {have}")]
    Truncated { opcode: u8, need: usize, have: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid device identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid command {0:?}: commands must be ASCII and end with '#'")]
    InvalidCommand(String),

    #[error("invalid date-time in payload: {0}")]
    InvalidDateTime(String),

    #[error("crc mismatch: computed {computed:#06x}, frame carries {carried:#06x}")]
    CrcMismatch { computed: u16, carried: u16 },
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("outbound queue full, closing slow session")]
    Backpressure,
}

impl Error {
    /// Check whether this error should tear down the connection or only
    /// drop the frame that produced it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::Transport(_)
                | Error::Protocol(ProtocolError::FrameTooLarge { .. })
        )
    }
}
