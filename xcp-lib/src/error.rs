use crate::packet::{ErrorCode, Pid};
use std::io;
use thiserror::Error;

/// Faults of the link itself. The device never produces these.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timeout waiting for slave response")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not connected to XCP slave")]
    NotConnected,

    #[error("Connection closed by peer")]
    Closed,
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout
    }
}

/// The device answered, but not with what the command needed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("XCP error: {0}")]
    Device(ErrorCode),

    #[error("Unexpected response PID: {0}")]
    UnexpectedResponse(Pid),

    #[error("Response too short: expected at least {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
}

/// Rejected locally, before anything reached the transport.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Value {value} cannot be represented in {size} bytes")]
    OutOfRange { value: String, size: usize },

    #[error("Invalid size {size}: {reason}")]
    BadSize { size: usize, reason: &'static str },

    #[error("Invalid JSON: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("Frame of {len} bytes exceeds the {max}-byte frame")]
    FrameOverflow { len: usize, max: usize },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid parameter catalog: {0}")]
    Catalog(String),
}

/// The primary error type for the `xcp-lib` library.
#[derive(Error, Debug)]
pub enum XcpError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl XcpError {
    /// Device error code carried by this error, if the slave reported one
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            XcpError::Protocol(ProtocolError::Device(code)) => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, XcpError::Transport(TransportError::Timeout))
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, XcpError::Transport(TransportError::NotConnected))
    }
}

impl From<io::Error> for XcpError {
    fn from(e: io::Error) -> Self {
        XcpError::Transport(TransportError::Io(e))
    }
}

impl From<tokio::time::error::Elapsed> for XcpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        XcpError::Transport(TransportError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, XcpError>;
