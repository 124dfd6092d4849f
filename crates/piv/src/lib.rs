//! Host-side driver for PIV smartcards per NIST SP 800-73-4, including the
//! YubicoPIV vendor extensions, plus an ECDH box primitive for sealing data
//! to a slot's key.
//!
//! [`enumerate`] and [`find`] discover attached cards and return [`Token`]
//! handles. All card operations run inside an exclusive transaction:
//!
//! ```no_run
//! use pivkit_apdu_pcsc::PcscDeviceManager;
//! use pivkit_piv::{enumerate, PinKind, SlotId};
//!
//! let manager = PcscDeviceManager::new()?;
//! let mut tokens = enumerate(&manager)?;
//! let token = tokens.first_mut().expect("a PIV card is attached");
//!
//! token.txn_begin()?;
//! token.select()?;
//! token.read_cert(SlotId::Authentication)?;
//! token.verify_pin(PinKind::App, Some("123456"), None, true)?;
//! let (sig, hash) = token.sign(SlotId::Authentication, b"hello", None)?;
//! token.txn_end();
//! # let _ = (sig, hash);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The [`EcdhBox`] envelope seals bytes to a slot's public key (or any EC
//! key) and opens them either with the holding card or offline with the
//! raw private key. Boxes are self-describing and survive round-trips
//! through their binary format across versions 1-3.

mod consts;
mod ecdh_box;
mod error;
mod key;
mod ops;
mod slot;
mod tlv;
mod token;
mod transceive;
mod types;

pub use consts::{AID_PIV, GUID_LEN, MAX_CERT_LEN};
pub use ecdh_box::{EcdhBox, BOX_DEFAULT_CIPHER, BOX_DEFAULT_KDF};
pub use error::{Error, ErrorKind, Result};
pub use key::{Curve, PrivateKey, PublicKey};
pub use slot::Slot;
pub use token::{enumerate, find, Token};
pub use types::{Algorithm, HashAlgo, PinKind, PinPolicy, SlotAuth, SlotId, TouchPolicy};

pub use pivkit_apdu_core::{CardTransport, StatusWord};
pub use pivkit_apdu_pcsc::{PcscConfig, PcscDeviceManager, PcscTransport};
