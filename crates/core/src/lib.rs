//! Core traits and types for APDU (Application Protocol Data Unit) operations
//!
//! This crate provides the foundational types for working with smart card
//! APDU commands and responses according to ISO/IEC 7816-4:
//!
//! - Creating and serializing APDU commands (short form)
//! - Parsing APDU responses and status words
//! - The [`CardTransport`] trait, the narrow interface a reader backend
//!   (such as PC/SC) must provide: raw transmission, exclusive transactions
//!   and card reset
//!
//! Application-level protocols (command chaining, TLV payloads, applet
//! semantics) are built on top of this crate and are out of scope here.
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod response;
pub mod transport;

mod error;
pub use error::{Error, Result};

pub use command::Command;
pub use response::status::StatusWord;
pub use response::Response;
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        transport::{CardTransport, TransportError},
        Bytes, BytesMut, Command, Error, Response, Result, StatusWord,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00);
        assert_eq!(cmd.cla, 0x00);
        assert_eq!(cmd.ins, 0xA4);

        let resp = Response::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert!(resp.status.is_success());
        assert_eq!(resp.data.as_ref(), &[0x01, 0x02]);
    }
}
