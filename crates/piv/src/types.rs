//! PIV value types: slots, algorithms, PIN kinds and key policies

use std::fmt;

use crate::consts;
use crate::error::Error;

/// A key/certificate slot on a PIV token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// 9A, PIV authentication
    Authentication,
    /// 9C, digital signature
    Signature,
    /// 9D, key management
    KeyManagement,
    /// 9E, card authentication
    CardAuthentication,
    /// 9B, card administration (management key)
    Admin,
    /// F9, YubicoPIV attestation key
    Attestation,
    /// 82..95, retired key history slot (raw slot byte)
    Retired(u8),
}

impl SlotId {
    /// The raw slot byte
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Authentication => 0x9A,
            Self::Signature => 0x9C,
            Self::KeyManagement => 0x9D,
            Self::CardAuthentication => 0x9E,
            Self::Admin => 0x9B,
            Self::Attestation => 0xF9,
            Self::Retired(id) => id,
        }
    }

    /// Parse a raw slot byte
    pub fn from_byte(id: u8) -> Result<Self, Error> {
        match id {
            0x9A => Ok(Self::Authentication),
            0x9B => Ok(Self::Admin),
            0x9C => Ok(Self::Signature),
            0x9D => Ok(Self::KeyManagement),
            0x9E => Ok(Self::CardAuthentication),
            0xF9 => Ok(Self::Attestation),
            0x82..=0x95 => Ok(Self::Retired(id)),
            _ => Err(Error::argument(
                "slot",
                "a supported PIV slot number",
                format!("{id:02x}"),
            )),
        }
    }

    /// Retired key history slot by index (0-based, 0..20)
    pub fn retired(index: u8) -> Result<Self, Error> {
        if index < 20 {
            Ok(Self::Retired(0x82 + index))
        } else {
            Err(Error::argument(
                "index",
                "a key history slot index below 20",
                index.to_string(),
            ))
        }
    }

    /// The data object tag holding this slot's certificate
    pub(crate) fn cert_tag(self) -> Result<u32, Error> {
        match self {
            Self::Authentication => Ok(consts::TAG_CERT_9A),
            Self::Signature => Ok(consts::TAG_CERT_9C),
            Self::KeyManagement => Ok(consts::TAG_CERT_9D),
            Self::CardAuthentication => Ok(consts::TAG_CERT_9E),
            Self::Retired(id) => Ok(consts::TAG_CERT_82 + (id - 0x82) as u32),
            _ => Err(Error::argument(
                "slot",
                "a slot with a certificate object",
                format!("{self}"),
            )),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.to_byte())
    }
}

/// PIV algorithm identifiers, including the JCOP hash-on-card variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Triple DES (admin key)
    TripleDes,
    /// RSA 1024
    Rsa1024,
    /// RSA 2048
    Rsa2048,
    /// AES-128 (admin key)
    Aes128,
    /// AES-192 (admin key)
    Aes192,
    /// AES-256 (admin key)
    Aes256,
    /// ECC P-256
    EccP256,
    /// ECC P-384
    EccP384,
    /// ECC P-256 with on-card SHA-1
    EccP256Sha1,
    /// ECC P-256 with on-card SHA-256
    EccP256Sha256,
    /// ECC P-384 with on-card SHA-1
    EccP384Sha1,
    /// ECC P-384 with on-card SHA-256
    EccP384Sha256,
    /// ECC P-384 with on-card SHA-384
    EccP384Sha384,
}

impl Algorithm {
    /// The wire identifier
    pub const fn id(self) -> u8 {
        match self {
            Self::TripleDes => 0x03,
            Self::Rsa1024 => 0x06,
            Self::Rsa2048 => 0x07,
            Self::Aes128 => 0x08,
            Self::Aes192 => 0x0A,
            Self::Aes256 => 0x0C,
            Self::EccP256 => 0x11,
            Self::EccP384 => 0x14,
            Self::EccP256Sha1 => 0xF0,
            Self::EccP256Sha256 => 0xF1,
            Self::EccP384Sha1 => 0xF2,
            Self::EccP384Sha256 => 0xF3,
            Self::EccP384Sha384 => 0xF4,
        }
    }

    /// Parse a wire identifier
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x03 => Some(Self::TripleDes),
            0x06 => Some(Self::Rsa1024),
            0x07 => Some(Self::Rsa2048),
            0x08 => Some(Self::Aes128),
            0x0A => Some(Self::Aes192),
            0x0C => Some(Self::Aes256),
            0x11 => Some(Self::EccP256),
            0x14 => Some(Self::EccP384),
            0xF0 => Some(Self::EccP256Sha1),
            0xF1 => Some(Self::EccP256Sha256),
            0xF2 => Some(Self::EccP384Sha1),
            0xF3 => Some(Self::EccP384Sha256),
            0xF4 => Some(Self::EccP384Sha384),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.id())
    }
}

/// The authentication methods usable to satisfy PIV access rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinKind {
    /// Application PIN (key reference 0x80)
    App,
    /// Global PIN (key reference 0x00)
    Global,
    /// On-card biometric comparison (key reference 0x96)
    Occ,
}

impl PinKind {
    /// The key reference byte used as P2 of VERIFY and friends
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::App => 0x80,
            Self::Global => 0x00,
            Self::Occ => 0x96,
        }
    }
}

/// YubicoPIV PIN policy for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// Card default
    Default,
    /// PIN never required
    Never,
    /// PIN required once per session
    Once,
    /// PIN required for every use
    Always,
}

impl PinPolicy {
    pub(crate) const fn id(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Never => 0x01,
            Self::Once => 0x02,
            Self::Always => 0x03,
        }
    }

    pub(crate) const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Default),
            0x01 => Some(Self::Never),
            0x02 => Some(Self::Once),
            0x03 => Some(Self::Always),
            _ => None,
        }
    }
}

/// YubicoPIV touch policy for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPolicy {
    /// Card default
    Default,
    /// Touch never required
    Never,
    /// Touch required for every use
    Always,
    /// Touch cached for 15 seconds
    Cached,
}

impl TouchPolicy {
    pub(crate) const fn id(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Never => 0x01,
            Self::Always => 0x02,
            Self::Cached => 0x03,
        }
    }

    pub(crate) const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Default),
            0x01 => Some(Self::Never),
            0x02 => Some(Self::Always),
            0x03 => Some(Self::Cached),
            _ => None,
        }
    }
}

/// Authentication requirements learned for a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotAuth {
    /// A PIN presentation is required before using the key
    pub pin: bool,
    /// A touch confirmation is required before using the key
    pub touch: bool,
}

/// Digests usable with [`crate::Token::sign`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    /// SHA-1 (legacy)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgo {
    /// Digest output length in bytes
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hash `data` with this digest
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        use sha1::Digest;
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}
