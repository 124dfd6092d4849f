//! Error types for the PC/SC transport

use pivkit_apdu_core::transport::TransportError;
use thiserror::Error;

/// PC/SC-specific errors
#[derive(Debug, Error)]
pub enum PcscError {
    /// Error reported by the PC/SC service
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// The PC/SC context is not functional
    #[error("PC/SC context is not functional: {0}")]
    Context(#[source] pcsc::Error),

    /// No readers available
    #[error("no readers available")]
    NoReadersAvailable,

    /// Reader not found
    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("no card present in reader: {0}")]
    NoCard(String),

    /// No active transaction
    #[error("no active transaction")]
    NoTransaction,

    /// Transaction already in progress
    #[error("transaction already in progress")]
    TransactionInProgress,
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::Pcsc(pcsc::Error::ResetCard) => Self::CardReset,
            PcscError::Pcsc(pcsc::Error::RemovedCard) => Self::CardRemoved,
            PcscError::Pcsc(pcsc::Error::NoSmartcard) => Self::Connection,
            PcscError::Pcsc(pcsc::Error::Timeout) => Self::Timeout,
            PcscError::Pcsc(pcsc::Error::InsufficientBuffer) => Self::BufferTooSmall,
            PcscError::Context(e) => Self::Other(format!("PC/SC context error: {e}")),
            PcscError::Pcsc(e) => Self::Other(format!("PC/SC error: {e}")),
            PcscError::NoReadersAvailable | PcscError::ReaderNotFound(_) => Self::Connection,
            PcscError::NoCard(_) => Self::Connection,
            PcscError::NoTransaction | PcscError::TransactionInProgress => Self::Transmission,
        }
    }
}
