//! PC/SC transport implementation

use std::ffi::CString;
use std::fmt;

use bytes::Bytes;
use pcsc::{Card, Context, Disposition, Transaction};
use tracing::{debug, warn};

use pivkit_apdu_core::transport::{CardTransport, TransportError};

use crate::{config::PcscConfig, error::PcscError};

/// Transport implementation using PC/SC
///
/// Owns one card connection and at most one open exclusive transaction.
pub struct PcscTransport {
    /// PC/SC context
    context: Context,
    /// Reader name
    reader_name: String,
    /// Configuration
    config: PcscConfig,
    /// Open exclusive transaction, if any.
    ///
    /// Borrows the boxed card below; declared first so it is always dropped
    /// before the card it refers to.
    transaction: Option<Transaction<'static>>,
    /// Card connection, if established. Boxed so the card has a stable
    /// address for the lifetime of an open transaction.
    card: Option<Box<Card>>,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("reader_name", &self.reader_name)
            .field("has_card", &self.card.is_some())
            .field("config", &self.config)
            .field("transaction_active", &self.transaction.is_some())
            .finish()
    }
}

impl PcscTransport {
    /// Create a new PC/SC transport for the specified reader
    pub(crate) fn new(
        context: Context,
        reader_name: &str,
        config: PcscConfig,
    ) -> Result<Self, PcscError> {
        let mut transport = Self {
            context,
            reader_name: reader_name.to_string(),
            config,
            transaction: None,
            card: None,
        };

        // Try to connect to the card
        let _ = transport.connect_card();

        Ok(transport)
    }

    /// Try to connect to the card
    fn connect_card(&mut self) -> Result<(), PcscError> {
        if self.card.is_some() {
            return Ok(());
        }

        let reader_cstr = CString::new(self.reader_name.clone())
            .map_err(|_| PcscError::ReaderNotFound(self.reader_name.clone()))?;

        match self.context.connect(
            &reader_cstr,
            self.config.share_mode.into(),
            self.config.protocols,
        ) {
            Ok(card) => {
                self.card = Some(Box::new(card));
                Ok(())
            }
            Err(pcsc::Error::NoSmartcard) => Err(PcscError::NoCard(self.reader_name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the current connection, ending any open transaction first
    fn disconnect(&mut self, disposition: Disposition) {
        self.transaction = None;
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(disposition);
        }
    }

    /// Get the ATR of the current card
    pub fn atr(&self) -> Result<Vec<u8>, PcscError> {
        self.active_card().map_or_else(
            || Err(PcscError::NoCard(self.reader_name.clone())),
            |card| {
                card.get_attribute_owned(pcsc::Attribute::AtrString)
                    .map_err(|e| e.into())
            },
        )
    }

    /// Check if the transport is connected to a card
    pub const fn has_card(&self) -> bool {
        self.card.is_some()
    }

    /// The card handle to use for the current state.
    ///
    /// While a transaction is open the card must be reached through it.
    fn active_card(&self) -> Option<&Card> {
        match &self.transaction {
            Some(txn) => Some(&**txn),
            None => self.card.as_deref(),
        }
    }

    /// Transmit a command to the card
    fn transmit_command(&mut self, command: &[u8]) -> Result<Bytes, PcscError> {
        self.connect_card()?;

        let card = match self.active_card() {
            Some(card) => card,
            None => return Err(PcscError::NoCard(self.reader_name.clone())),
        };

        let mut response_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];

        match card.transmit(command, &mut response_buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(e) => {
                if matches!(e, pcsc::Error::ResetCard | pcsc::Error::RemovedCard) {
                    self.disconnect(Disposition::LeaveCard);
                }
                Err(e.into())
            }
        }
    }
}

impl CardTransport for PcscTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.transmit_command(command).map_err(TransportError::from)
    }

    fn begin_transaction(&mut self) -> Result<(), TransportError> {
        if self.transaction.is_some() {
            return Err(PcscError::TransactionInProgress.into());
        }

        let mut reconnected = false;
        loop {
            self.connect_card().map_err(TransportError::from)?;

            let card = self.card.as_deref_mut().expect("card connected above");
            // SAFETY: the transaction borrows the boxed card stored alongside
            // it. The box gives the card a stable address, the transaction
            // field is declared before the card so it drops first, and every
            // path that replaces or drops the card clears the transaction
            // beforehand.
            let card: &'static mut Card = unsafe { &mut *(card as *mut Card) };

            match card.transaction() {
                Ok(txn) => {
                    self.transaction = Some(txn);
                    return Ok(());
                }
                Err(pcsc::Error::ResetCard) if !reconnected => {
                    // Card was reset by another session; reconnect once,
                    // requesting a reset, and retry.
                    debug!(reader = %self.reader_name, "card reset, reconnecting");
                    self.disconnect(Disposition::ResetCard);
                    reconnected = true;
                }
                Err(e) => return Err(PcscError::from(e).into()),
            }
        }
    }

    fn end_transaction(&mut self, reset: bool) -> Result<(), TransportError> {
        let txn = self
            .transaction
            .take()
            .ok_or(TransportError::from(PcscError::NoTransaction))?;

        let disposition = if reset {
            Disposition::ResetCard
        } else {
            Disposition::LeaveCard
        };

        if let Err((_, e)) = txn.end(disposition) {
            warn!(reader = %self.reader_name, error = %e, "failed to end transaction");
            return Err(PcscError::from(e).into());
        }
        Ok(())
    }

    fn reader_name(&self) -> &str {
        &self.reader_name
    }

    fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.disconnect(Disposition::ResetCard);
        self.connect_card().map_err(Into::into)
    }

    fn full_apdu_trace(&self) -> bool {
        self.config.full_apdu_trace
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        self.disconnect(Disposition::LeaveCard);
    }
}
