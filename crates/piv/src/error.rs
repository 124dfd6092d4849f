//! Error taxonomy for PIV operations
//!
//! Every error carries a kind (see [`ErrorKind`]) and, where the failure
//! wraps a lower-level one, a boxed cause. [`Error::caused_by`] walks the
//! cause chain, which the tolerant discovery paths use to distinguish
//! "object absent" from real failures.

use pivkit_apdu_core::{StatusWord, TransportError};
use thiserror::Error;

use crate::types::SlotId;

/// Result type for PIV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for PIV operations
#[derive(Debug, Error)]
pub enum Error {
    /// A PC/SC call failed
    #[error("PC/SC call failed")]
    Pcsc(#[source] TransportError),

    /// The PC/SC context is not functional
    #[error("PC/SC context is not functional")]
    PcscContext(#[source] TransportError),

    /// Failed to communicate with a PIV device
    #[error("failed to communicate with PIV device '{reader}'")]
    Io {
        /// Reader the device is attached to
        reader: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Card returned a status word with no more specific mapping
    #[error("card replied with SW={sw:04x} ({name}) to {ins}")]
    Apdu {
        /// Instruction that was being executed
        ins: String,
        /// The status word
        sw: u16,
        /// Symbolic status word name
        name: &'static str,
    },

    /// Card returned an empty reply where a payload was required
    #[error("card replied with empty APDU to {ins}")]
    EmptyReply {
        /// Instruction that was being executed
        ins: String,
    },

    /// Unexpected TLV tag in a PIV response
    #[error("invalid tag 0x{tag:x} in PIV {ins} response")]
    Tag {
        /// Instruction whose response was being parsed
        ins: String,
        /// The offending tag
        tag: u32,
    },

    /// Device returned an invalid or unsupported payload
    #[error("PIV device '{reader}' returned invalid or unsupported payload")]
    InvalidData {
        /// Reader the device is attached to
        reader: String,
        /// Underlying parse failure
        #[source]
        source: Box<Error>,
    },

    /// Malformed data encountered while parsing
    #[error("{0}")]
    Malformed(String),

    /// Permission denied by the card
    #[error("permission denied {doing} on PIV device '{reader}'")]
    Permission {
        /// What was being attempted
        doing: String,
        /// Reader the device is attached to
        reader: String,
        /// Underlying status failure, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// Fewer PIN retries remain than the caller's minimum
    #[error("insufficient PIN retries remaining (minimum {minimum}, remaining {remaining})")]
    MinRetries {
        /// The caller-supplied floor
        minimum: u32,
        /// Retries left on the card
        remaining: u32,
    },

    /// A requested object, device or key was not found
    #[error("{what}")]
    NotFound {
        /// What was missing
        what: String,
        /// Underlying status failure, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// More than one token matched a lookup
    #[error("more than one PIV token matched GUID")]
    Duplicate,

    /// Functionality not supported by the device
    #[error("{what} not supported by PIV device '{reader}'")]
    NotSupported {
        /// The unsupported functionality
        what: String,
        /// Reader the device is attached to
        reader: String,
        /// Underlying status failure, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// A length constraint was violated
    #[error("{0}")]
    Length(String),

    /// A key or cipher algorithm is unknown or unusable
    #[error("{0}")]
    BadAlgorithm(String),

    /// A certificate object carried CertInfo flags SP 800-73 forbids
    #[error("{0}")]
    CertFlag(String),

    /// A compressed certificate failed to inflate within bounds
    #[error("{0}")]
    Decompression(String),

    /// The device is out of storage
    #[error("out of memory to store {what} on PIV device '{reader}'")]
    DeviceOutOfMemory {
        /// What was being written
        what: String,
        /// Reader the device is attached to
        reader: String,
        /// Underlying status failure
        #[source]
        source: Box<Error>,
    },

    /// YubicoPIV reset preconditions not met
    #[error("conditions for use of INS_RESET not met (all PINs and PUK must be blocked)")]
    ResetConditions(#[source] Box<Error>),

    /// The attestation policy extension is absent
    #[error("YubicoPIV attestation extension for policy not present in attestation cert")]
    ExtensionMissing,

    /// The attestation policy extension is malformed
    #[error("YubicoPIV attestation extension for policy does not contain valid data")]
    ExtensionInvalid,

    /// The box is sealed and its plaintext cannot be taken
    #[error("box is sealed; data cannot be taken (open it first)")]
    BoxSealed,

    /// Box padding failed validation
    #[error("padding failed validation")]
    Padding,

    /// Box prelude did not carry the expected magic bytes
    #[error("bad magic number (0x{0:02x}{1:02x})")]
    Magic(u8, u8),

    /// Box version is outside the supported range
    #[error("unsupported box version 0x{0:02x}")]
    Version(u8),

    /// EC curve not supported
    #[error("EC curve '{0}' not supported")]
    Curve(String),

    /// A slot's key failed to prove possession
    #[error("failed to authenticate key in slot {slot} of PIV device '{reader}'")]
    KeyAuth {
        /// The slot under test
        slot: SlotId,
        /// Reader the device is attached to
        reader: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// Two public keys that must match do not
    #[error("given public key and slot's public key do not match")]
    KeysNotEqual,

    /// An argument violated its contract
    #[error("argument '{name}' must be {expected} (was {actual})")]
    Argument {
        /// Argument name
        name: &'static str,
        /// What the argument must be
        expected: String,
        /// What it actually was
        actual: String,
    },
}

/// Discriminant of [`Error`], used for cause-chain queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Pcsc,
    PcscContext,
    Io,
    Apdu,
    Tag,
    InvalidData,
    Permission,
    MinRetries,
    NotFound,
    Duplicate,
    NotSupported,
    Length,
    BadAlgorithm,
    CertFlag,
    Decompression,
    DeviceOutOfMemory,
    ResetConditions,
    ExtensionMissing,
    ExtensionInvalid,
    BoxSealed,
    Padding,
    Magic,
    Version,
    Curve,
    KeyAuth,
    KeysNotEqual,
    Argument,
}

impl Error {
    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pcsc(_) => ErrorKind::Pcsc,
            Self::PcscContext(_) => ErrorKind::PcscContext,
            Self::Io { .. } => ErrorKind::Io,
            Self::Apdu { .. } | Self::EmptyReply { .. } => ErrorKind::Apdu,
            Self::Tag { .. } => ErrorKind::Tag,
            Self::InvalidData { .. } | Self::Malformed(_) => ErrorKind::InvalidData,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::MinRetries { .. } => ErrorKind::MinRetries,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Duplicate => ErrorKind::Duplicate,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Length(_) => ErrorKind::Length,
            Self::BadAlgorithm(_) => ErrorKind::BadAlgorithm,
            Self::CertFlag(_) => ErrorKind::CertFlag,
            Self::Decompression(_) => ErrorKind::Decompression,
            Self::DeviceOutOfMemory { .. } => ErrorKind::DeviceOutOfMemory,
            Self::ResetConditions(_) => ErrorKind::ResetConditions,
            Self::ExtensionMissing => ErrorKind::ExtensionMissing,
            Self::ExtensionInvalid => ErrorKind::ExtensionInvalid,
            Self::BoxSealed => ErrorKind::BoxSealed,
            Self::Padding => ErrorKind::Padding,
            Self::Magic(..) => ErrorKind::Magic,
            Self::Version(_) => ErrorKind::Version,
            Self::Curve(_) => ErrorKind::Curve,
            Self::KeyAuth { .. } => ErrorKind::KeyAuth,
            Self::KeysNotEqual => ErrorKind::KeysNotEqual,
            Self::Argument { .. } => ErrorKind::Argument,
        }
    }

    /// Direct PIV-level cause of this error, if it wraps one
    fn cause(&self) -> Option<&Error> {
        match self {
            Self::Io { source, .. }
            | Self::InvalidData { source, .. }
            | Self::DeviceOutOfMemory { source, .. }
            | Self::ResetConditions(source) => Some(source),
            Self::Permission { source, .. }
            | Self::NotFound { source, .. }
            | Self::NotSupported { source, .. }
            | Self::KeyAuth { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// Whether this error, or anything in its cause chain, is of `kind`
    pub fn caused_by(&self, kind: ErrorKind) -> bool {
        self.kind() == kind || self.cause().is_some_and(|c| c.caused_by(kind))
    }

    pub(crate) fn argument(
        name: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Argument {
            name,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn sw(ins: impl Into<String>, sw: StatusWord) -> Self {
        Self::Apdu {
            ins: ins.into(),
            sw: sw.to_u16(),
            name: sw.name(),
        }
    }

    pub(crate) fn io(reader: impl Into<String>, source: Error) -> Self {
        Self::Io {
            reader: reader.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn tag(ins: impl Into<String>, tag: u32) -> Self {
        Self::Tag {
            ins: ins.into(),
            tag,
        }
    }

    pub(crate) fn invdata(reader: impl Into<String>, source: Error) -> Self {
        Self::InvalidData {
            reader: reader.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn permission(
        reader: impl Into<String>,
        doing: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Permission {
            doing: doing.into(),
            reader: reader.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>, source: Option<Error>) -> Self {
        Self::NotFound {
            what: what.into(),
            source: source.map(Box::new),
        }
    }

    pub(crate) fn not_supported(
        reader: impl Into<String>,
        what: impl Into<String>,
        source: Option<Error>,
    ) -> Self {
        Self::NotSupported {
            what: what.into(),
            reader: reader.into(),
            source: source.map(Box::new),
        }
    }

    pub(crate) fn not_ykpiv() -> Self {
        Self::argument("token", "a YubicoPIV-compatible token", "not")
    }
}
