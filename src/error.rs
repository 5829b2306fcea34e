use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the scanner
pub type Result<T> = std::result::Result<T, EtherNetIpError>;

/// Errors produced by the EtherNet/IP scanner.
///
/// Transport and parsing failures (`ConnectionFailure`, `Timeout`,
/// `MalformedResponse`, `Io`) are worth retrying as-is. `CipError` is the
/// device rejecting the request itself and usually needs a different request.
#[derive(Error, Debug)]
pub enum EtherNetIpError {
    /// Null, zero or out-of-range input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Engine used after shutdown
    #[error("Scanner not initialized or already shut down")]
    NotInitialized,

    /// Socket could not be established, or send/receive failed
    #[error("Connection failure to {target}: {reason}")]
    ConnectionFailure { target: String, reason: String },

    /// No response within the caller's budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Response shorter than the envelope requires, wrong item type or wrong command echo
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Device answered with a non-zero CIP general status
    #[error("CIP error 0x{status:02X}: {message}")]
    CipError {
        status: u8,
        extended: Option<u16>,
        message: String,
    },

    /// A buffer larger than the configured limit was requested
    #[error("Buffer of {requested} bytes exceeds the {limit} byte limit")]
    OutOfMemory { requested: usize, limit: usize },

    /// Payload shorter than the type being decoded requires
    #[error("Response too short: needed {needed} bytes, got {available}")]
    ResponseTooShort { needed: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EtherNetIpError {
    /// Builds a `CipError` with the standard message for `status`
    pub fn cip(status: u8, extended: Option<u16>) -> Self {
        EtherNetIpError::CipError {
            status,
            extended,
            message: crate::cip::status_message(status).to_string(),
        }
    }

    /// True for transport/protocol failures a caller may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EtherNetIpError::ConnectionFailure { .. }
                | EtherNetIpError::Timeout(_)
                | EtherNetIpError::MalformedResponse(_)
                | EtherNetIpError::Io(_)
        )
    }

    /// True when the device itself rejected the request
    pub fn is_device_error(&self) -> bool {
        matches!(self, EtherNetIpError::CipError { .. })
    }

    /// The CIP general status, if this is a device-reported error
    pub fn cip_status(&self) -> Option<u8> {
        match self {
            EtherNetIpError::CipError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub(crate) fn too_short(needed: usize, available: usize) -> EtherNetIpError {
    EtherNetIpError::ResponseTooShort { needed, available }
}
