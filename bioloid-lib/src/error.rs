use crate::packet::ErrorCode;
use std::io;
use thiserror::Error;

/// The primary error type for the `bioloid-lib` library.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Timeout waiting for a status packet")]
    Timeout,

    #[error("Checksum error in received packet")]
    Checksum,

    /// The peer answered with a status packet whose error byte was not NONE.
    #[error("Rcvd Status: {0}")]
    Status(ErrorCode),

    #[error("Too much data: {len} parameter bytes, at most {max} fit in a packet")]
    TooMuchData { len: usize, max: usize },

    #[error("Range {offset}..{} is outside of a {size} byte control table", .offset + .len)]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BusError {
    /// The protocol error code (or pseudo-code) this error corresponds to, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            BusError::Timeout => Some(ErrorCode::TIMEOUT),
            BusError::Checksum => Some(ErrorCode::CHECKSUM),
            BusError::Status(code) => Some(*code),
            BusError::TooMuchData { .. } => Some(ErrorCode::TOO_MUCH_DATA),
            BusError::OutOfRange { .. } => Some(ErrorCode::RANGE),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}
