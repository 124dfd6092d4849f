//! Error type for card transports

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish a connection to the card
    #[error("failed to establish connection to card")]
    Connection,

    /// Failed to transmit data to the card
    #[error("failed to transmit data to card")]
    Transmission,

    /// The card was reset by another session
    #[error("card was reset")]
    CardReset,

    /// The card was removed from the reader
    #[error("card was removed")]
    CardRemoved,

    /// The reader-level service is unavailable
    #[error("reader service unavailable")]
    Service,

    /// The operation timed out
    #[error("operation timed out")]
    Timeout,

    /// The response did not fit the receive buffer
    #[error("response buffer too small")]
    BufferTooSmall,

    /// Backend-specific error
    #[error("{0}")]
    Other(String),
}
