//! APDU response handling
//!
//! A response is a data payload followed by a two-byte status word trailer.

pub mod status;

use bytes::Bytes;

use crate::Error;
use status::StatusWord;

/// Parsed APDU response: payload plus status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload (without the trailer)
    pub data: Bytes,
    /// Status word trailer
    pub status: StatusWord,
}

impl Response {
    /// Split raw reply bytes into payload and status word.
    ///
    /// Replies shorter than the two-byte trailer fail with
    /// [`Error::TruncatedResponse`].
    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < 2 {
            return Err(Error::TruncatedResponse(raw.len()));
        }
        let (body, trailer) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: Bytes::copy_from_slice(body),
            status: StatusWord::new(trailer[0], trailer[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let resp = Response::from_bytes(&[0xAA, 0xBB, 0x61, 0x10]).unwrap();
        assert_eq!(resp.data.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(resp.status, StatusWord::new(0x61, 0x10));

        let resp = Response::from_bytes(&[0x90, 0x00]).unwrap();
        assert!(resp.data.is_empty());
        assert!(resp.status.is_success());
    }

    #[test]
    fn test_from_bytes_truncated() {
        assert!(matches!(
            Response::from_bytes(&[0x90]),
            Err(Error::TruncatedResponse(1))
        ));
    }
}
