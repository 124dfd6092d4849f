//! APDU command definitions
//!
//! This module provides the generic command structure and its short-form
//! serialization according to ISO/IEC 7816-4.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Base class byte for interindustry commands
pub const CLA_ISO: u8 = 0x00;

/// Command chaining bit in the class byte
pub const CLA_CHAIN: u8 = 0x10;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected response length (Le); 0 requests up to 256 bytes
    pub le: u8,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: 0,
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: 0,
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = le;
        self
    }

    /// Serialize to raw short-form APDU bytes.
    ///
    /// Layout is `CLA INS P1 P2` followed by either `Le` (no data), or
    /// `Lc data Le`. When the chaining bit is set in the class byte the
    /// trailing `Le` is omitted, as further command segments follow.
    ///
    /// Only short-form encoding is supported; data of 256 bytes or more
    /// fails with [`Error::CommandTooLong`].
    pub fn serialize(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(6 + self.data.as_ref().map_or(0, |d| d.len()));
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);

        match self.data.as_ref().filter(|d| !d.is_empty()) {
            None => buf.put_u8(self.le),
            Some(data) => {
                if data.len() > 0xFF {
                    return Err(Error::CommandTooLong(data.len()));
                }
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
                if self.cla & CLA_CHAIN == 0 {
                    buf.put_u8(self.le);
                }
            }
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_case2() {
        let cmd = Command::new(0x00, 0xB0, 0x00, 0x00).with_le(0xFF);
        assert_eq!(cmd.serialize().unwrap().as_ref(), &[0x00, 0xB0, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn test_serialize_with_data() {
        let data = Bytes::from_static(&[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]);
        let cmd = Command::new_with_data(0x00, 0xA4, 0x04, 0x00, data);
        let bytes = cmd.serialize().unwrap();

        assert_eq!(bytes[0], 0x00); // CLA
        assert_eq!(bytes[1], 0xA4); // INS
        assert_eq!(bytes[2], 0x04); // P1
        assert_eq!(bytes[3], 0x00); // P2
        assert_eq!(bytes[4], 0x06); // Lc
        assert_eq!(&bytes[5..11], &[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]);
        assert_eq!(bytes[11], 0x00); // Le
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn test_serialize_chained_omits_le() {
        let data = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let cmd = Command::new_with_data(CLA_ISO | CLA_CHAIN, 0xDB, 0x3F, 0xFF, data);
        let bytes = cmd.serialize().unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 3);
        assert_eq!(bytes[4], 0x03);
    }

    #[test]
    fn test_serialize_rejects_long_data() {
        let data = Bytes::from(vec![0u8; 256]);
        let cmd = Command::new_with_data(0x00, 0xDB, 0x3F, 0xFF, data);
        assert!(matches!(
            cmd.serialize(),
            Err(Error::CommandTooLong(256))
        ));
    }
}
