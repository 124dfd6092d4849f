//! Unified error type for APDU operations

use thiserror::Error;

use crate::transport::TransportError;

/// The main error type for APDU operations
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-related errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Command data does not fit a short-form APDU
    #[error("command data length {0} does not fit a short-form APDU")]
    CommandTooLong(usize),

    /// Reply was shorter than the two-byte status word trailer
    #[error("reply of {0} bytes is too short to carry a status word")]
    TruncatedResponse(usize),
}

/// Result type for APDU operations
pub type Result<T> = std::result::Result<T, Error>;
