//! Transport traits for APDU communication with cards
//!
//! This module provides the abstraction a reader backend must implement:
//! raw APDU transmission, exclusive transactions and card reset.

mod error;

use std::fmt;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

/// Trait for card transports
///
/// A transport is responsible for sending and receiving raw APDU bytes over
/// one open reader channel, and for the exclusive-access transaction
/// bracketing that channel. It has no knowledge of command structure or
/// protocol details.
pub trait CardTransport: Send + fmt::Debug {
    /// Send raw APDU bytes to the card and return the raw response bytes
    /// (including the status word trailer).
    ///
    /// The call blocks until the reader returns a response or reports
    /// failure. Timeouts are owned by the reader layer.
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if self.full_apdu_trace() {
            trace!(command = %hex::encode(command), "transmitting raw command");
        }
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                if self.full_apdu_trace() {
                    trace!(response = %hex::encode(response), "received raw response");
                }
            }
            Err(e) => {
                debug!(error = %e, "transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of `transmit_raw`
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Acquire an exclusive transaction on the card.
    ///
    /// Implementations retry once after a card reset before failing.
    fn begin_transaction(&mut self) -> Result<(), TransportError>;

    /// Release the exclusive transaction, resetting the card iff `reset`.
    fn end_transaction(&mut self, reset: bool) -> Result<(), TransportError>;

    /// Name of the reader this transport is bound to
    fn reader_name(&self) -> &str;

    /// Check if the transport is connected to a physical card
    fn is_connected(&self) -> bool;

    /// Reset the transport connection
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Whether full APDU hex dumps should be traced
    fn full_apdu_trace(&self) -> bool {
        false
    }
}

#[cfg(any(test, feature = "mock"))]
mod mock {
    use super::*;

    /// In-memory transport returning scripted responses, for tests
    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        /// Scripted responses, consumed front to back (the last one repeats)
        pub responses: Vec<Bytes>,
        /// Raw commands that were sent
        pub commands: Vec<Bytes>,
        /// Whether the transport is connected
        pub connected: bool,
        /// Number of open transactions seen
        pub transactions: usize,
        /// Whether the last `end_transaction` asked for a card reset
        pub last_end_reset: Option<bool>,
        in_transaction: bool,
    }

    impl MockTransport {
        /// Create a new mock transport with the given scripted responses
        pub fn new(responses: Vec<Bytes>) -> Self {
            Self {
                responses,
                connected: true,
                ..Default::default()
            }
        }

        /// Create a mock transport that always returns the given response
        pub fn with_response(response: Bytes) -> Self {
            Self::new(vec![response])
        }

        /// Create a mock transport that always returns success (90 00)
        pub fn with_success() -> Self {
            Self::with_response(Bytes::from_static(&[0x90, 0x00]))
        }
    }

    impl CardTransport for MockTransport {
        fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
            if !self.connected {
                return Err(TransportError::Connection);
            }
            assert!(self.in_transaction, "transmit outside of a transaction");

            self.commands.push(Bytes::copy_from_slice(command));

            if self.responses.is_empty() {
                return Err(TransportError::Transmission);
            }
            if self.responses.len() == 1 {
                Ok(self.responses[0].clone())
            } else {
                Ok(self.responses.remove(0))
            }
        }

        fn begin_transaction(&mut self) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::Connection);
            }
            self.in_transaction = true;
            self.transactions += 1;
            Ok(())
        }

        fn end_transaction(&mut self, reset: bool) -> Result<(), TransportError> {
            self.in_transaction = false;
            self.last_end_reset = Some(reset);
            Ok(())
        }

        fn reader_name(&self) -> &str {
            "Mock Reader 00"
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn reset(&mut self) -> Result<(), TransportError> {
            self.connected = true;
            self.commands.clear();
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
