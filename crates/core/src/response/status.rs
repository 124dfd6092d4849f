//! Status word definitions for APDU responses

use std::fmt;

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Check if this status word indicates success (90 00)
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Check if more response data is available (61 XX)
    pub const fn is_bytes_remaining(&self) -> bool {
        self.sw1 == 0x61
    }

    /// Check if the card asks for a corrected Le (6C XX)
    pub const fn is_correct_le(&self) -> bool {
        self.sw1 == 0x6C
    }

    /// Check if this is a warning with non-volatile memory unchanged (62 XX)
    pub const fn is_warning_no_change(&self) -> bool {
        self.sw1 == 0x62
    }

    /// Check if this is a warning with non-volatile memory changed (63 XX)
    pub const fn is_warning(&self) -> bool {
        self.sw1 == 0x63
    }

    /// The XX byte carried by 61 XX and 6C XX status words
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 || self.sw1 == 0x6C {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// Check for the incorrect-PIN pattern (63 CX)
    pub const fn is_incorrect_pin(&self) -> bool {
        self.sw1 == 0x63 && (self.sw2 & 0xF0) == 0xC0
    }

    /// Retry counter carried by a 63 CX status word
    pub const fn pin_retries(&self) -> Option<u8> {
        if self.is_incorrect_pin() {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Symbolic name used in logs, mirroring common ISO 7816 mnemonics
    pub const fn name(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "NO_ERROR",
            (0x62, 0x82) => "WARNING_EOF",
            (0x67, 0x00) => "WRONG_LENGTH",
            (0x69, 0x82) => "SECURITY_STATUS_NOT_SATISFIED",
            (0x69, 0x83) => "FILE_INVALID",
            (0x69, 0x85) => "CONDITIONS_NOT_SATISFIED",
            (0x6A, 0x80) => "WRONG_DATA",
            (0x6A, 0x81) => "FUNC_NOT_SUPPORTED",
            (0x6A, 0x82) => "FILE_NOT_FOUND",
            (0x6A, 0x84) => "OUT_OF_MEMORY",
            (0x6A, 0x86) => "INCORRECT_P1P2",
            (0x6D, 0x00) => "INS_NOT_SUPPORTED",
            (0x61, _) => "BYTES_REMAINING",
            (0x6C, _) => "CORRECT_LE",
            (0x63, n) if (n & 0xF0) == 0xC0 => "INCORRECT_PIN",
            (0x62, _) => "WARNING_NO_CHANGE",
            (0x63, _) => "WARNING_UNKNOWN",
            _ => "UNKNOWN",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Common status words
pub mod common {
    use super::StatusWord;

    /// Success (90 00)
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    /// End of file reached before reading Le bytes (62 82)
    pub const WARNING_EOF: StatusWord = StatusWord::new(0x62, 0x82);

    /// Wrong length (67 00)
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);

    /// Security status not satisfied (69 82)
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);

    /// Authentication method blocked (69 83)
    pub const FILE_INVALID: StatusWord = StatusWord::new(0x69, 0x83);

    /// Conditions of use not satisfied (69 85)
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);

    /// Incorrect parameters in the data field (6A 80)
    pub const WRONG_DATA: StatusWord = StatusWord::new(0x6A, 0x80);

    /// Function not supported (6A 81)
    pub const FUNC_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6A, 0x81);

    /// File not found (6A 82)
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);

    /// Not enough memory space in the file (6A 84)
    pub const OUT_OF_MEMORY: StatusWord = StatusWord::new(0x6A, 0x84);

    /// Incorrect parameters P1-P2 (6A 86)
    pub const INCORRECT_P1P2: StatusWord = StatusWord::new(0x6A, 0x86);

    /// Instruction code not supported (6D 00)
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6D, 0x00);
}
