//! Credential operations: signing, ECDH, PIN management, admin
//! authentication, key generation/import and file access
//!
//! Every operation here requires an open transaction and, for anything that
//! touches the PIV application state, a prior [`Token::select`] in the same
//! session. Operations that change the card's authentication state arrange
//! for a card reset when the transaction ends, so PIN state cannot leak to
//! unrelated callers.

use bytes::Bytes;
use cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use pivkit_apdu_core::command::CLA_ISO;
use pivkit_apdu_core::response::status::common as sw;
use pivkit_apdu_core::{CardTransport, Command};
use rand::{rngs::OsRng, RngCore};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use tracing::debug;
use zeroize::Zeroizing;

use crate::consts::*;
use crate::error::{Error, Result};
use crate::key::{Curve, PrivateKey, PublicKey};
use crate::slot::Slot;
use crate::tlv::{TlvReader, TlvWriter};
use crate::token::Token;
use crate::transceive::{transceive, transceive_chain};
use crate::types::{Algorithm, HashAlgo, PinKind, PinPolicy, SlotId, TouchPolicy};

/// DER DigestInfo prefixes for PKCS#1 v1.5 signing blocks
const DI_SHA1: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];
const DI_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const DI_SHA512: &[u8] = &[
    0x30, 0x51, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

fn parse_ga_response(data: &[u8], ins: &str) -> Result<Vec<u8>> {
    let mut tlv = TlvReader::new(data);
    let tag = tlv.read_tag()?;
    if tag != 0x7C {
        return Err(Error::tag(ins, tag));
    }
    let tag = tlv.read_tag()?;
    if tag != GA_TAG_RESPONSE {
        return Err(Error::tag(ins, tag));
    }
    let value = tlv.read_value().to_vec();
    tlv.end()?;
    tlv.end()?;
    Ok(value)
}

fn check_pin(name: &'static str, pin: &str) -> Result<()> {
    if pin.is_empty() || pin.len() > 8 {
        return Err(Error::argument(
            name,
            "a string 1-8 chars in length",
            format!("{} chars long", pin.len()),
        ));
    }
    Ok(())
}

fn pin_buf(pin: &str) -> Zeroizing<[u8; 8]> {
    let mut buf = Zeroizing::new([0xFFu8; 8]);
    buf[..pin.len()].copy_from_slice(pin.as_bytes());
    buf
}

impl<T: CardTransport> Token<T> {
    /// Sign `data` with the key in `slot_id`.
    ///
    /// The digest is chosen from the slot algorithm and the optional caller
    /// preference: RSA keys take SHA-1/SHA-256 (and SHA-512 on RSA-2048),
    /// EC keys take the curve-matched SHA-2. Cards that advertise the
    /// hash-on-card algorithm variants are fed the raw message under the
    /// largest advertised digest instead. Returns the signature and the
    /// digest actually used.
    pub fn sign(
        &mut self,
        slot_id: SlotId,
        data: &[u8],
        hash: Option<HashAlgo>,
    ) -> Result<(Vec<u8>, HashAlgo)> {
        assert!(self.in_txn, "sign requires an open transaction");

        let alg = self
            .slot(slot_id)
            .and_then(Slot::algorithm)
            .ok_or_else(|| {
                Error::argument("slot", "a slot with a known key algorithm", format!("{slot_id}"))
            })?;

        let mut promoted = None;
        let (inplen, hash) = match alg {
            Algorithm::Rsa1024 => (
                128,
                match hash {
                    Some(HashAlgo::Sha1) => HashAlgo::Sha1,
                    _ => HashAlgo::Sha256,
                },
            ),
            Algorithm::Rsa2048 => (
                256,
                match hash {
                    Some(HashAlgo::Sha1) => HashAlgo::Sha1,
                    Some(HashAlgo::Sha512) => HashAlgo::Sha512,
                    _ => HashAlgo::Sha256,
                },
            ),
            Algorithm::EccP256 => {
                // JC22x cards running PivApplet cannot sign a host-computed
                // digest; they advertise hash-on-card algorithm ids instead.
                let ch_sha256 = self.algs.contains(&Algorithm::EccP256Sha256);
                let cardhash = ch_sha256 || self.algs.contains(&Algorithm::EccP256Sha1);
                let hash = match hash {
                    Some(HashAlgo::Sha1) => {
                        if cardhash {
                            promoted = Some(Algorithm::EccP256Sha1);
                        }
                        HashAlgo::Sha1
                    }
                    _ => {
                        if cardhash && ch_sha256 {
                            promoted = Some(Algorithm::EccP256Sha256);
                            HashAlgo::Sha256
                        } else if cardhash {
                            promoted = Some(Algorithm::EccP256Sha1);
                            HashAlgo::Sha1
                        } else {
                            HashAlgo::Sha256
                        }
                    }
                };
                (32, hash)
            }
            Algorithm::EccP384 => {
                let ch_sha384 = self.algs.contains(&Algorithm::EccP384Sha384);
                let ch_sha256 = self.algs.contains(&Algorithm::EccP384Sha256);
                let cardhash =
                    ch_sha384 || ch_sha256 || self.algs.contains(&Algorithm::EccP384Sha1);
                let hash = match hash {
                    Some(HashAlgo::Sha1) => {
                        if cardhash {
                            promoted = Some(Algorithm::EccP384Sha1);
                        }
                        HashAlgo::Sha1
                    }
                    Some(HashAlgo::Sha256) => {
                        if cardhash && ch_sha256 {
                            promoted = Some(Algorithm::EccP384Sha256);
                            HashAlgo::Sha256
                        } else if cardhash {
                            promoted = Some(Algorithm::EccP384Sha1);
                            HashAlgo::Sha1
                        } else {
                            HashAlgo::Sha256
                        }
                    }
                    _ => {
                        if cardhash && ch_sha384 {
                            promoted = Some(Algorithm::EccP384Sha384);
                            HashAlgo::Sha384
                        } else if cardhash && ch_sha256 {
                            promoted = Some(Algorithm::EccP384Sha256);
                            HashAlgo::Sha256
                        } else if cardhash {
                            promoted = Some(Algorithm::EccP384Sha1);
                            HashAlgo::Sha1
                        } else {
                            HashAlgo::Sha384
                        }
                    }
                };
                (48, hash)
            }
            other => {
                return Err(Error::not_supported(
                    self.reader_name(),
                    format!("key algorithm {other} in slot {slot_id}"),
                    None,
                ));
            }
        };

        let block: Zeroizing<Vec<u8>> = if promoted.is_some() {
            debug!("doing hash on card");
            Zeroizing::new(data.to_vec())
        } else {
            let digest = hash.digest(data);
            match alg {
                Algorithm::Rsa1024 | Algorithm::Rsa2048 => {
                    // PKCS#1 v1.5: 00 01 FF..FF 00 || DigestInfo
                    let di_prefix = match hash {
                        HashAlgo::Sha1 => DI_SHA1,
                        HashAlgo::Sha256 => DI_SHA256,
                        HashAlgo::Sha512 => DI_SHA512,
                        HashAlgo::Sha384 => unreachable!("SHA-384 is never chosen for RSA"),
                    };
                    let tlen = di_prefix.len() + digest.len();
                    let mut block = vec![0xFFu8; inplen];
                    block[0] = 0x00;
                    block[1] = 0x01;
                    block[inplen - tlen - 1] = 0x00;
                    block[inplen - tlen..inplen - digest.len()].copy_from_slice(di_prefix);
                    block[inplen - digest.len()..].copy_from_slice(&digest);
                    Zeroizing::new(block)
                }
                _ => {
                    let mut block = vec![0u8; inplen];
                    block[..digest.len()].copy_from_slice(&digest);
                    Zeroizing::new(block)
                }
            }
        };

        let sig = self.sign_prehash_with_alg(slot_id, promoted.unwrap_or(alg), &block)?;
        Ok((sig, hash))
    }

    /// Sign a caller-prepared block (a digest, or a full PKCS#1 v1.5 padded
    /// block for RSA) with the key in `slot_id`
    pub fn sign_prehash(&mut self, slot_id: SlotId, block: &[u8]) -> Result<Vec<u8>> {
        let alg = self
            .slot(slot_id)
            .and_then(Slot::algorithm)
            .ok_or_else(|| {
                Error::argument("slot", "a slot with a known key algorithm", format!("{slot_id}"))
            })?;
        self.sign_prehash_with_alg(slot_id, alg, block)
    }

    fn sign_prehash_with_alg(
        &mut self,
        slot_id: SlotId,
        alg: Algorithm,
        block: &[u8],
    ) -> Result<Vec<u8>> {
        assert!(self.in_txn, "sign_prehash requires an open transaction");

        let mut w = TlvWriter::new();
        w.push(0x7C);
        // Empty RESPONSE tag names what we are asking for, then the data we
        // provide as the CHALLENGE.
        w.push(GA_TAG_RESPONSE);
        w.pop();
        w.push(GA_TAG_CHALLENGE);
        w.write(block);
        w.pop();
        w.pop();

        let ins = format!("INS_GEN_AUTH({slot_id})");
        let cmd = Command::new_with_data(CLA_ISO, INS_GEN_AUTH, alg.id(), slot_id.to_byte(), w.finish());
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.is_ok_or_warning() {
            parse_ga_response(&reply.data, &ins)
                .map_err(|e| Error::invdata(self.reader_name(), e))
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            // We probably needed a PIN for this.
            if let Some(slot) = self.slot_mut(slot_id) {
                slot.set_pin_required(true);
            }
            Err(Error::permission(
                self.reader_name(),
                format!("signing data with key in slot {slot_id}"),
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw == sw::WRONG_DATA || reply.sw == sw::INCORRECT_P1P2 {
            Err(Error::not_supported(
                self.reader_name(),
                format!("signature generation by key (or no key present) in slot {slot_id}"),
                Some(Error::sw(&ins, reply.sw)),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// ECDH between the key in `slot_id` and `pubkey`, returning the shared
    /// secret
    pub fn ecdh(&mut self, slot_id: SlotId, pubkey: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        assert!(self.in_txn, "ecdh requires an open transaction");

        let alg = self
            .slot(slot_id)
            .and_then(Slot::algorithm)
            .ok_or_else(|| {
                Error::argument("slot", "a slot with a known key algorithm", format!("{slot_id}"))
            })?;
        let point = pubkey.ec_point()?;

        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(GA_TAG_RESPONSE);
        w.pop();
        w.push(GA_TAG_EXP);
        w.write(&point);
        w.pop();
        w.pop();

        let ins = format!("INS_GEN_AUTH({slot_id})");
        let cmd = Command::new_with_data(CLA_ISO, INS_GEN_AUTH, alg.id(), slot_id.to_byte(), w.finish());
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.is_ok_or_warning() {
            parse_ga_response(&reply.data, &ins)
                .map(Zeroizing::new)
                .map_err(|e| Error::invdata(self.reader_name(), e))
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            if let Some(slot) = self.slot_mut(slot_id) {
                slot.set_pin_required(true);
            }
            Err(Error::permission(
                self.reader_name(),
                format!("performing ECDH for slot {slot_id}"),
                Error::sw(&ins, reply.sw),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Prove that the public key the host holds for a slot matches the
    /// private key on the card, by signing a random challenge
    pub fn auth_key(&mut self, slot_id: SlotId, pubkey: &PublicKey) -> Result<()> {
        assert!(self.in_txn, "auth_key requires an open transaction");

        let keyauth = |source: Option<Error>| Error::KeyAuth {
            slot: slot_id,
            reader: self.reader_name().to_string(),
            source: source.map(Box::new),
        };

        let slot_pub = self
            .slot(slot_id)
            .and_then(|s| s.public_key().cloned())
            .ok_or_else(|| {
                Error::argument("slot", "a slot with a known public key", format!("{slot_id}"))
            })?;
        if *pubkey != slot_pub {
            return Err(keyauth(Some(Error::KeysNotEqual)));
        }

        // 64 bytes is overkill for a challenge, but more doesn't hurt.
        let mut chal = Zeroizing::new([0u8; 64]);
        OsRng.fill_bytes(chal.as_mut());

        let (sig, hash) = self.sign(slot_id, chal.as_ref(), None)?;
        verify_signature(pubkey, hash, chal.as_ref(), &sig).map_err(|e| Error::KeyAuth {
            slot: slot_id,
            reader: self.reader_name().to_string(),
            source: Some(Box::new(e)),
        })
    }

    /// Authenticate to the card with the 9B admin key via single-step
    /// challenge-response. `alg` selects 3DES or an AES variant; `key` must
    /// be exactly the cipher's key length.
    pub fn admin_auth(&mut self, key: &[u8], alg: Algorithm) -> Result<()> {
        assert!(self.in_txn, "admin_auth requires an open transaction");

        let (key_len, block_len) = match alg {
            Algorithm::TripleDes => (24, 8),
            Algorithm::Aes128 => (16, 16),
            Algorithm::Aes192 => (24, 16),
            Algorithm::Aes256 => (32, 16),
            other => {
                return Err(Error::argument(
                    "alg",
                    "a supported admin key algorithm",
                    format!("{other}"),
                ));
            }
        };
        if key.len() != key_len {
            return Err(Error::argument(
                "key",
                format!("a buffer of length {key_len}"),
                format!("{} bytes long", key.len()),
            ));
        }

        // Only single-step challenge-response, not the two-step mutual auth
        // using a witness value.
        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(GA_TAG_CHALLENGE);
        w.pop();
        w.pop();

        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_GEN_AUTH,
            alg.id(),
            SlotId::Admin.to_byte(),
            w.finish(),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw == sw::INCORRECT_P1P2 {
            return Err(Error::not_found(
                format!("PIV device '{}' has no admin key", self.reader_name()),
                Some(Error::sw("INS_GEN_AUTH(9b)", reply.sw)),
            ));
        } else if reply.sw == sw::WRONG_DATA || reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            return Err(Error::permission(
                self.reader_name(),
                "authenticating with 9B admin key",
                Error::sw("INS_GEN_AUTH(9b)", reply.sw),
            ));
        } else if !reply.sw.is_success() {
            return Err(Error::not_supported(
                self.reader_name(),
                "admin challenge-response authentication",
                Some(Error::sw("INS_GEN_AUTH(9b)", reply.sw)),
            ));
        }

        let challenge = (|| -> Result<Vec<u8>> {
            let mut tlv = TlvReader::new(&reply.data);
            let tag = tlv.read_tag()?;
            if tag != 0x7C {
                return Err(Error::tag("INS_GEN_AUTH(9b)", tag));
            }
            let mut challenge = None;
            while !tlv.at_end() {
                let tag = tlv.read_tag()?;
                if tag == GA_TAG_CHALLENGE {
                    challenge = Some(tlv.read_value().to_vec());
                    tlv.end()?;
                } else {
                    tlv.skip();
                }
            }
            tlv.end()?;
            challenge.ok_or_else(|| {
                Error::Malformed("INS_GEN_AUTH(9b) reply carried no challenge".into())
            })
        })()
        .map_err(|e| Error::invdata(self.reader_name(), e))?;

        if challenge.len() != block_len {
            return Err(Error::invdata(
                self.reader_name(),
                Error::Length(format!(
                    "INS_GEN_AUTH(9b) returned {} byte challenge but cipher blocks are {block_len} bytes",
                    challenge.len()
                )),
            ));
        }

        // One block under a zero IV is plain block encryption.
        let mut response = Zeroizing::new(challenge);
        match alg {
            Algorithm::TripleDes => des::TdesEde3::new_from_slice(key)
                .expect("key length checked above")
                .encrypt_block(GenericArray::from_mut_slice(&mut response[..])),
            Algorithm::Aes128 => aes::Aes128::new_from_slice(key)
                .expect("key length checked above")
                .encrypt_block(GenericArray::from_mut_slice(&mut response[..])),
            Algorithm::Aes192 => aes::Aes192::new_from_slice(key)
                .expect("key length checked above")
                .encrypt_block(GenericArray::from_mut_slice(&mut response[..])),
            Algorithm::Aes256 => aes::Aes256::new_from_slice(key)
                .expect("key length checked above")
                .encrypt_block(GenericArray::from_mut_slice(&mut response[..])),
            _ => unreachable!("algorithm validated above"),
        }

        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(GA_TAG_RESPONSE);
        w.write(&response);
        w.pop();
        w.pop();

        self.must_reset = true;

        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_GEN_AUTH,
            alg.id(),
            SlotId::Admin.to_byte(),
            w.finish(),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            Ok(())
        } else if reply.sw == sw::INCORRECT_P1P2 {
            Err(Error::not_found(
                format!("PIV device '{}' has no admin key", self.reader_name()),
                Some(Error::sw("INS_GEN_AUTH(9b)", reply.sw)),
            ))
        } else if reply.sw == sw::WRONG_DATA || reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "authenticating with 9B admin key",
                Error::sw("INS_GEN_AUTH(9b)", reply.sw),
            ))
        } else {
            let err = Error::sw("INS_GEN_AUTH(9B)", reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Verify a PIN, or query the card's authentication state.
    ///
    /// The call shape selects the behavior:
    ///
    /// 1. `(None, None)` checks whether the session is already
    ///    authenticated, succeeding either way;
    /// 2. `(None, Some(r))` stores the remaining tries into `r` without
    ///    spending one;
    /// 3. `(Some(pin), None)` presents the PIN;
    /// 4. `(Some(pin), Some(r))` with `*r == 0` presents the PIN and on
    ///    failure stores the remaining tries;
    /// 5. `(Some(pin), Some(r))` with `*r > 0` first checks the counter and
    ///    refuses with `MinRetries` when at most `*r` tries remain.
    ///
    /// `canskip` skips the PIN presentation when the session is already
    /// authenticated; callers using PIN-always slots must pass `false`.
    pub fn verify_pin(
        &mut self,
        kind: PinKind,
        pin: Option<&str>,
        mut retries: Option<&mut u32>,
        canskip: bool,
    ) -> Result<()> {
        assert!(self.in_txn, "verify_pin requires an open transaction");

        let min_retries = retries.as_deref().copied().unwrap_or(0);
        let ins = format!("INS_VERIFY({:02x})", kind.to_byte());

        // An initial empty VERIFY probes the current auth state. Wanted for
        // shapes 1, 2 and 5 always, and for 3 and 4 only with canskip.
        if pin.is_none() || canskip || min_retries > 0 {
            let cmd = Command::new(CLA_ISO, INS_VERIFY, 0x00, kind.to_byte());
            let reply = transceive_chain(&mut self.transport, &cmd)?;

            if reply.sw.is_incorrect_pin() {
                // Not authenticated.
                let remaining = (reply.sw.to_u16() & 0x000F) as u32;
                if pin.is_some() && min_retries > 0 && remaining <= min_retries {
                    if let Some(r) = retries.as_deref_mut() {
                        *r = remaining;
                    }
                    return Err(Error::MinRetries {
                        minimum: min_retries,
                        remaining,
                    });
                } else if pin.is_none() {
                    if let Some(r) = retries.as_deref_mut() {
                        *r = remaining;
                    }
                    return Ok(());
                }
                // Shapes 3-5: proceed to present the PIN.
            } else if reply.sw == sw::WRONG_LENGTH || reply.sw == sw::WRONG_DATA {
                // This applet likely doesn't implement the empty VERIFY
                // (easy to miss in SP 800-73, and many applets have had
                // bugs here).
                if pin.is_none() {
                    return Err(Error::not_supported(
                        self.reader_name(),
                        "reading PIN retry counter",
                        Some(Error::sw(&ins, reply.sw)),
                    ));
                }
                // With a PIN in hand the probe was best-effort; continue.
            } else if reply.sw.is_success() {
                // Already authenticated.
                if pin.is_none() || canskip {
                    return Ok(());
                }
                // Shape 5: the retries constraint is met; present the PIN.
            } else {
                let err = Error::sw(&ins, reply.sw);
                debug!(reader = %self.reader_name(), error = %err, "card did not accept INS_VERIFY");
                return Err(err);
            }
        }

        let pin = pin.expect("probe-only shapes returned above");
        check_pin("pin", pin)?;
        let buf = pin_buf(pin);

        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_VERIFY,
            0x00,
            kind.to_byte(),
            Bytes::copy_from_slice(buf.as_ref()),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw == sw::FILE_INVALID {
            if let Some(r) = retries.as_deref_mut() {
                *r = 0;
            }
            Err(Error::permission(
                self.reader_name(),
                "verifying PIN (PIN is blocked, out of retry attempts)",
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw.is_incorrect_pin() {
            if let Some(r) = retries.as_deref_mut() {
                *r = (reply.sw.to_u16() & 0x000F) as u32;
            }
            Err(Error::permission(
                self.reader_name(),
                "verifying PIN (incorrect PIN supplied)",
                Error::sw(&ins, reply.sw),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Change a PIN, authenticating with the old one
    pub fn change_pin(&mut self, kind: PinKind, pin: &str, newpin: &str) -> Result<()> {
        assert!(self.in_txn, "change_pin requires an open transaction");
        check_pin("pin", pin)?;
        check_pin("newpin", newpin)?;

        let mut buf = Zeroizing::new([0xFFu8; 16]);
        buf[..pin.len()].copy_from_slice(pin.as_bytes());
        buf[8..8 + newpin.len()].copy_from_slice(newpin.as_bytes());

        let ins = format!("INS_CHANGE_PIN({:02x})", kind.to_byte());
        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_CHANGE_PIN,
            0x00,
            kind.to_byte(),
            Bytes::copy_from_slice(buf.as_ref()),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw.is_incorrect_pin() {
            Err(Error::permission(
                self.reader_name(),
                "changing PIN (incorrect PIN supplied)",
                Error::sw(&ins, reply.sw),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Set a new PIN, authenticating with the PUK
    pub fn reset_pin(&mut self, kind: PinKind, puk: &str, newpin: &str) -> Result<()> {
        assert!(self.in_txn, "reset_pin requires an open transaction");
        check_pin("puk", puk)?;
        check_pin("newpin", newpin)?;

        let mut buf = Zeroizing::new([0xFFu8; 16]);
        buf[..puk.len()].copy_from_slice(puk.as_bytes());
        buf[8..8 + newpin.len()].copy_from_slice(newpin.as_bytes());

        let ins = format!("INS_RESET_PIN({:02x})", kind.to_byte());
        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_RESET_PIN,
            0x00,
            kind.to_byte(),
            Bytes::copy_from_slice(buf.as_ref()),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw.is_incorrect_pin() {
            Err(Error::permission(
                self.reader_name(),
                "resetting PIN (incorrect PUK supplied)",
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw == sw::FILE_INVALID {
            Err(Error::permission(
                self.reader_name(),
                "resetting PIN (PUK is blocked, too many incorrect attempts)",
                Error::sw(&ins, reply.sw),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Generate a new asymmetric key in a slot, returning its public key
    pub fn generate(&mut self, slot_id: SlotId, alg: Algorithm) -> Result<PublicKey> {
        assert!(self.in_txn, "generate requires an open transaction");

        let mut w = TlvWriter::new();
        w.push(0xAC);
        w.push(0x80);
        w.write_uint(alg.id() as u32);
        w.pop();
        w.pop();

        let cmd =
            Command::new_with_data(CLA_ISO, INS_GEN_ASYM, 0x00, slot_id.to_byte(), w.finish());
        self.generate_common(cmd, slot_id, alg)
    }

    /// Generate a new asymmetric key with YubicoPIV PIN and touch policies
    pub fn ykpiv_generate(
        &mut self,
        slot_id: SlotId,
        alg: Algorithm,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<PublicKey> {
        assert!(self.in_txn, "generate requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }
        // The cached touch option only exists on YubicoPIV 4.3 and later.
        if touch_policy == TouchPolicy::Cached && !self.ykpiv_version_at_least(4, 3, 0) {
            let v = self.ykpiv_version().unwrap_or_default();
            return Err(Error::argument(
                "touch_policy",
                "TOUCH_CACHED only on YubicoPIV version >=4.3",
                format!("not supported by this device (v{}.{}.{})", v[0], v[1], v[2]),
            ));
        }

        let mut w = TlvWriter::new();
        w.push(0xAC);
        w.push(0x80);
        w.write_uint(alg.id() as u32);
        w.pop();
        if pin_policy != PinPolicy::Default {
            w.push(0xAA);
            w.write_uint(pin_policy.id() as u32);
            w.pop();
        }
        if touch_policy != TouchPolicy::Default {
            w.push(0xAB);
            w.write_uint(touch_policy.id() as u32);
            w.pop();
        }
        w.pop();

        let cmd =
            Command::new_with_data(CLA_ISO, INS_GEN_ASYM, 0x00, slot_id.to_byte(), w.finish());
        self.generate_common(cmd, slot_id, alg)
    }

    fn generate_common(
        &mut self,
        cmd: Command,
        slot_id: SlotId,
        alg: Algorithm,
    ) -> Result<PublicKey> {
        let curve = match alg {
            Algorithm::Rsa1024 | Algorithm::Rsa2048 => None,
            Algorithm::EccP256 => Some(Curve::P256),
            Algorithm::EccP384 => Some(Curve::P384),
            other => {
                return Err(Error::argument(
                    "alg",
                    "a supported asymmetric algorithm",
                    format!("{other}"),
                ));
            }
        };

        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.is_ok_or_warning() {
            let parse = || -> Result<PublicKey> {
                let mut tlv = TlvReader::new(&reply.data);
                let tag = tlv.read_tag()?;
                if tag != 0x7F49 {
                    return Err(Error::tag("INS_GEN_ASYM", tag));
                }

                let mut modulus: Option<Vec<u8>> = None;
                let mut exponent: Option<Vec<u8>> = None;
                let mut point: Option<Vec<u8>> = None;
                while !tlv.at_end() {
                    let tag = tlv.read_tag()?;
                    match (curve, tag) {
                        (None, 0x81) => {
                            modulus = Some(tlv.read_value().to_vec());
                            tlv.end()?;
                        }
                        (None, 0x82) => {
                            exponent = Some(tlv.read_value().to_vec());
                            tlv.end()?;
                        }
                        (Some(_), 0x86) => {
                            point = Some(tlv.read_value().to_vec());
                            tlv.end()?;
                        }
                        (_, other) => return Err(Error::tag("INS_GEN_ASYM", other)),
                    }
                }
                tlv.end()?;

                match curve {
                    None => {
                        let n = modulus.ok_or_else(|| {
                            Error::Malformed("INS_GEN_ASYM reply carried no modulus".into())
                        })?;
                        let e = exponent.ok_or_else(|| {
                            Error::Malformed("INS_GEN_ASYM reply carried no exponent".into())
                        })?;
                        let key = rsa::RsaPublicKey::new(
                            rsa::BigUint::from_bytes_be(&n),
                            rsa::BigUint::from_bytes_be(&e),
                        )
                        .map_err(|e| Error::Malformed(format!("bad generated RSA key: {e}")))?;
                        Ok(PublicKey::Rsa(key))
                    }
                    Some(curve) => {
                        let point = point.ok_or_else(|| {
                            Error::Malformed("INS_GEN_ASYM reply carried no EC point".into())
                        })?;
                        PublicKey::from_sec1(curve, &point)
                    }
                }
            };
            parse().map_err(|e| Error::invdata(self.reader_name(), e))
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                format!("generating new key in slot {slot_id}"),
                Error::sw("INS_GEN_ASYM", reply.sw),
            ))
        } else {
            Err(Error::sw("INS_GEN_ASYM", reply.sw))
        }
    }

    /// Import a host-held private key into a slot (YubicoPIV only)
    pub fn ykpiv_import(
        &mut self,
        slot_id: SlotId,
        key: &PrivateKey,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<()> {
        assert!(self.in_txn, "import requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }

        let mut w = TlvWriter::new();
        let alg = match key {
            PrivateKey::Rsa(key) => {
                let alg = match key.size() * 8 {
                    1024 => Algorithm::Rsa1024,
                    2048 => Algorithm::Rsa2048,
                    bits => {
                        return Err(Error::argument(
                            "key",
                            "an RSA private key of a supported size",
                            format!("a {bits}-bit RSA key"),
                        ));
                    }
                };
                let primes = key.primes();
                if primes.len() != 2 {
                    return Err(Error::argument(
                        "key",
                        "an RSA private key with two primes",
                        format!("{} primes", primes.len()),
                    ));
                }
                let (p, q) = (&primes[0], &primes[1]);
                let one = rsa::BigUint::from(1u8);
                let dp = key.d() % (p - &one);
                let dq = key.d() % (q - &one);
                // p is prime, so the inverse of q mod p is q^(p-2) mod p.
                let qinv = q.modpow(&(p - rsa::BigUint::from(2u8)), p);

                for (tag, v) in [
                    (0x01u32, p.clone()),
                    (0x02, q.clone()),
                    (0x03, dp),
                    (0x04, dq),
                    (0x05, qinv),
                ] {
                    let bytes = Zeroizing::new(v.to_bytes_be());
                    w.push(tag);
                    w.write(&bytes);
                    w.pop();
                }
                alg
            }
            PrivateKey::P256(key) => {
                let d = Zeroizing::new(key.to_bytes().to_vec());
                w.push(0x06);
                w.write(&d);
                w.pop();
                Algorithm::EccP256
            }
            PrivateKey::P384(key) => {
                let d = Zeroizing::new(key.to_bytes().to_vec());
                w.push(0x06);
                w.write(&d);
                w.pop();
                Algorithm::EccP384
            }
        };

        if pin_policy != PinPolicy::Default {
            w.push(0xAA);
            w.write_uint(pin_policy.id() as u32);
            w.pop();
        }
        if touch_policy != TouchPolicy::Default {
            w.push(0xAB);
            w.write_uint(touch_policy.id() as u32);
            w.pop();
        }

        let ins = format!("INS_IMPORT_ASYM({slot_id})");
        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_IMPORT_ASYM,
            alg.id(),
            slot_id.to_byte(),
            w.finish(),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            Ok(())
        } else if reply.sw == sw::OUT_OF_MEMORY {
            Err(Error::DeviceOutOfMemory {
                what: "asymmetric key object".into(),
                reader: self.reader_name().to_string(),
                source: Box::new(Error::sw(&ins, reply.sw)),
            })
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "importing private key",
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw == sw::FUNC_NOT_SUPPORTED || reply.sw == sw::INS_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                "importing private keys",
                Some(Error::sw(&ins, reply.sw)),
            ))
        } else {
            Err(Error::sw(&ins, reply.sw))
        }
    }

    /// Read a PIV file object by tag, returning the contents of its `53`
    /// container
    pub fn read_file(&mut self, tag: u32) -> Result<Zeroizing<Vec<u8>>> {
        assert!(self.in_txn, "read_file requires an open transaction");

        let ins = format!("INS_GET_DATA({tag:x})");
        let reply = transceive_chain(&mut self.transport, &Self::get_data_cmd(tag))?;

        if reply.is_ok_or_warning() {
            if reply.data.is_empty() {
                return Err(Error::invdata(
                    self.reader_name(),
                    Error::EmptyReply { ins },
                ));
            }
            let parse = || -> Result<Vec<u8>> {
                let mut tlv = TlvReader::new(&reply.data);
                let rtag = tlv.read_tag()?;
                if rtag != 0x53 {
                    return Err(Error::tag(&ins, rtag));
                }
                let value = tlv.read_value().to_vec();
                tlv.end()?;
                Ok(value)
            };
            parse()
                .map(Zeroizing::new)
                .map_err(|e| Error::invdata(self.reader_name(), e))
        } else if reply.sw == sw::FILE_NOT_FOUND {
            Err(Error::not_found(
                format!("no PIV file object found at tag {tag:x}"),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                format!("reading PIV file object at tag {tag:x}"),
                Error::sw("INS_GET_DATA", reply.sw),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Write a PIV file object by tag
    pub fn write_file(&mut self, tag: u32, data: &[u8]) -> Result<()> {
        assert!(self.in_txn, "write_file requires an open transaction");

        let mut w = TlvWriter::new();
        w.push(0x5C);
        w.write_uint(tag);
        w.pop();
        w.push(0x53);
        w.write(data);
        w.pop();

        let ins = format!("INS_PUT_DATA({tag:x})");
        let cmd = Command::new_with_data(CLA_ISO, INS_PUT_DATA, 0x3F, 0xFF, w.finish());
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            Ok(())
        } else if reply.sw == sw::OUT_OF_MEMORY {
            Err(Error::DeviceOutOfMemory {
                what: "file object".into(),
                reader: self.reader_name().to_string(),
                source: Box::new(Error::sw(&ins, reply.sw)),
            })
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "writing file object",
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw == sw::FUNC_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                format!("file object {tag:x}"),
                Some(Error::sw(&ins, reply.sw)),
            ))
        } else {
            Err(Error::sw(&ins, reply.sw))
        }
    }

    /// Write a certificate into a slot's data object. `certinfo` carries
    /// the CertInfo flags (e.g. `0x01` when `der` is GZIP-compressed).
    pub fn write_cert(&mut self, slot_id: SlotId, der: &[u8], certinfo: u8) -> Result<()> {
        assert!(self.in_txn, "write_cert requires an open transaction");

        let tag = slot_id.cert_tag()?;
        let mut w = TlvWriter::new();
        w.push(0x70);
        w.write(der);
        w.pop();
        w.push(0x71);
        w.write_byte(certinfo);
        w.pop();

        self.write_file(tag, &w.finish())
    }

    /// Write the Key History object. `offcard > 0` requires a URL; the slot
    /// counts must sum to at most 20.
    pub fn write_keyhistory(
        &mut self,
        oncard: u32,
        offcard: u32,
        offcard_url: Option<&str>,
    ) -> Result<()> {
        assert!(self.in_txn, "write_keyhistory requires an open transaction");

        if oncard > 20 || offcard > 20 || oncard + offcard > 20 {
            return Err(Error::argument(
                "oncard + offcard",
                "at most the 20 key history slots",
                format!("{}", oncard + offcard),
            ));
        }
        if offcard > 0 && offcard_url.is_none() {
            return Err(Error::argument(
                "offcard_url",
                "a valid URL string when offcard > 0",
                "None",
            ));
        }

        let mut w = TlvWriter::new();
        w.push(0xC1);
        w.write_uint(oncard);
        w.pop();
        w.push(0xC2);
        w.write_uint(offcard);
        w.pop();
        if let Some(url) = offcard_url {
            w.push(0xF3);
            w.write(url.as_bytes());
            w.pop();
        }

        self.write_file(TAG_KEYHIST, &w.finish())?;
        self.set_keyhist(oncard, offcard, offcard_url);
        Ok(())
    }

    /// Fetch the attestation certificate for a slot's key (YubicoPIV only)
    pub fn ykpiv_attest(&mut self, slot_id: SlotId) -> Result<Vec<u8>> {
        assert!(self.in_txn, "attest requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }

        let ins = format!("INS_ATTEST({slot_id})");
        let cmd = Command::new(CLA_ISO, INS_ATTEST, slot_id.to_byte(), 0x00);
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.is_ok_or_warning() {
            if reply.data.is_empty() {
                return Err(Error::not_supported(
                    self.reader_name(),
                    "YubicoPIV attestation",
                    Some(Error::Malformed(format!(
                        "no data payload returned to {ins}"
                    ))),
                ));
            }
            Ok(reply.data.to_vec())
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                format!("attesting slot {slot_id}"),
                Error::sw(&ins, reply.sw),
            ))
        } else if reply.sw == sw::INS_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                "YubicoPIV attestation",
                Some(Error::sw(&ins, reply.sw)),
            ))
        } else {
            let err = Error::sw(&ins, reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Factory-reset the PIV applet (YubicoPIV only; requires both PINs and
    /// the PUK to be blocked)
    pub fn ykpiv_reset(&mut self) -> Result<()> {
        assert!(self.in_txn, "reset requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }

        let cmd = Command::new(CLA_ISO, INS_RESET, 0, 0);
        let reply = transceive(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "resetting YubicoPIV",
                Error::sw("INS_RESET", reply.sw),
            ))
        } else if reply.sw == sw::CONDITIONS_NOT_SATISFIED {
            Err(Error::ResetConditions(Box::new(Error::sw(
                "INS_RESET",
                reply.sw,
            ))))
        } else if reply.sw == sw::INS_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                "YubicoPIV extensions",
                Some(Error::sw("INS_RESET", reply.sw)),
            ))
        } else {
            Err(Error::sw("INS_RESET", reply.sw))
        }
    }

    /// Set the PIN and PUK retry counters (YubicoPIV only)
    pub fn ykpiv_set_pin_retries(&mut self, pintries: u8, puktries: u8) -> Result<()> {
        assert!(self.in_txn, "set_pin_retries requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }

        let cmd = Command::new(CLA_ISO, INS_SET_PIN_RETRIES, pintries, puktries);
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "setting PIN retries",
                Error::sw("INS_SET_PIN_RETRIES", reply.sw),
            ))
        } else if reply.sw == sw::INS_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                "YubicoPIV extensions",
                Some(Error::sw("INS_SET_PIN_RETRIES", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_SET_PIN_RETRIES", reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Replace the 9B admin key (YubicoPIV only)
    pub fn ykpiv_set_admin(&mut self, key: &[u8], touch_policy: TouchPolicy) -> Result<()> {
        assert!(self.in_txn, "set_admin requires an open transaction");

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }

        let p2 = match touch_policy {
            TouchPolicy::Default | TouchPolicy::Never => 0xFF,
            TouchPolicy::Always => 0xFE,
            other => {
                return Err(Error::argument(
                    "touch_policy",
                    "Default, Never or Always",
                    format!("{other:?}"),
                ));
            }
        };

        let mut data = Zeroizing::new(Vec::with_capacity(3 + key.len()));
        data.push(Algorithm::TripleDes.id());
        data.push(SlotId::Admin.to_byte());
        data.push(key.len() as u8);
        data.extend_from_slice(key);

        let cmd = Command::new_with_data(
            CLA_ISO,
            INS_SET_MGMT,
            0xFF,
            p2,
            Bytes::copy_from_slice(&data),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            self.must_reset = true;
            Ok(())
        } else if reply.sw == sw::SECURITY_STATUS_NOT_SATISFIED {
            Err(Error::permission(
                self.reader_name(),
                "changing 9B admin key",
                Error::sw("YK_INS_SET_MGMT", reply.sw),
            ))
        } else if reply.sw == sw::INS_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                "YubicoPIV extensions",
                Some(Error::sw("YK_INS_SET_MGMT", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_SET_MGMT", reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "card did not accept INS_SET_MGMT");
            Err(err)
        }
    }
}

fn verify_signature(pubkey: &PublicKey, hash: HashAlgo, message: &[u8], sig: &[u8]) -> Result<()> {
    match (pubkey, hash) {
        (PublicKey::P256(pk), HashAlgo::Sha256) => {
            use p256::ecdsa::signature::Verifier;
            let vk = p256::ecdsa::VerifyingKey::from(pk);
            let sig = p256::ecdsa::Signature::from_der(sig)
                .map_err(|_| Error::Malformed("unparseable ECDSA signature".into()))?;
            vk.verify(message, &sig)
                .map_err(|_| Error::Malformed("ECDSA signature failed verification".into()))
        }
        (PublicKey::P384(pk), HashAlgo::Sha384) => {
            use p384::ecdsa::signature::Verifier;
            let vk = p384::ecdsa::VerifyingKey::from(pk);
            let sig = p384::ecdsa::Signature::from_der(sig)
                .map_err(|_| Error::Malformed("unparseable ECDSA signature".into()))?;
            vk.verify(message, &sig)
                .map_err(|_| Error::Malformed("ECDSA signature failed verification".into()))
        }
        (PublicKey::Rsa(pk), hash) => {
            let digest = hash.digest(message);
            let scheme = match hash {
                HashAlgo::Sha1 => rsa::Pkcs1v15Sign::new::<sha1::Sha1>(),
                HashAlgo::Sha256 => rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                HashAlgo::Sha384 => rsa::Pkcs1v15Sign::new::<sha2::Sha384>(),
                HashAlgo::Sha512 => rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
            };
            pk.verify(scheme, &digest, sig)
                .map_err(|_| Error::Malformed("RSA signature failed verification".into()))
        }
        _ => Err(Error::not_supported(
            "host",
            format!("verifying a {hash:?} card signature"),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pivkit_apdu_core::transport::MockTransport;

    fn sw_only(status: u16) -> Bytes {
        Bytes::from(status.to_be_bytes().to_vec())
    }

    fn with_sw(mut body: Vec<u8>, status: u16) -> Bytes {
        body.extend_from_slice(&status.to_be_bytes());
        Bytes::from(body)
    }

    fn token_in_txn(responses: Vec<Bytes>) -> Token<MockTransport> {
        let mut token = Token::new(MockTransport::new(responses));
        token.txn_begin().unwrap();
        token
    }

    #[test]
    #[should_panic(expected = "requires an open transaction")]
    fn test_ops_require_transaction() {
        let mut token = Token::new(MockTransport::with_success());
        let _ = token.verify_pin(PinKind::App, None, None, false);
    }

    #[test]
    fn test_verify_pin_probe_reports_retries() {
        // S4: probing with an empty VERIFY and SW 63C3 leaves 3 retries
        let mut token = token_in_txn(vec![sw_only(0x63C3)]);
        let mut retries = 0u32;
        token
            .verify_pin(PinKind::App, None, Some(&mut retries), false)
            .unwrap();
        assert_eq!(retries, 3);

        // the empty VERIFY must carry no PIN bytes
        let probe = &token.transport.commands[0];
        assert_eq!(probe.as_ref(), &[0x00, 0x20, 0x00, 0x80, 0x00]);
    }

    #[test]
    fn test_verify_pin_probe_already_authed() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.verify_pin(PinKind::App, None, None, false).unwrap();
        assert_eq!(token.transport.commands.len(), 1);
        assert!(!token.must_reset);
    }

    #[test]
    fn test_verify_pin_probe_unsupported_on_buggy_card() {
        let mut token = token_in_txn(vec![sw_only(0x6700)]);
        let err = token
            .verify_pin(PinKind::App, None, None, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_verify_pin_success_schedules_reset() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token
            .verify_pin(PinKind::App, Some("123456"), None, false)
            .unwrap();
        assert!(token.must_reset);

        // 8-byte 0xFF padded PIN
        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[4], 8);
        assert_eq!(&cmd[5..13], b"123456\xff\xff");
    }

    #[test]
    fn test_verify_pin_min_retries_refuses() {
        let mut token = token_in_txn(vec![sw_only(0x63C2)]);
        let mut retries = 3u32;
        let err = token
            .verify_pin(PinKind::App, Some("123456"), Some(&mut retries), false)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MinRetries {
                minimum: 3,
                remaining: 2
            }
        ));
        assert_eq!(retries, 2);
        // only the probe was sent; the PIN never left the host
        assert_eq!(token.transport.commands.len(), 1);
    }

    #[test]
    fn test_verify_pin_wrong_updates_retries() {
        let mut token = token_in_txn(vec![sw_only(0x63C4)]);
        let mut retries = 0u32;
        let err = token
            .verify_pin(PinKind::App, Some("123456"), Some(&mut retries), false)
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::Permission));
        assert_eq!(retries, 4);
    }

    #[test]
    fn test_verify_pin_blocked() {
        let mut token = token_in_txn(vec![sw_only(0x6983)]);
        let mut retries = 9u32;
        let err = token
            .verify_pin(PinKind::App, Some("123456"), Some(&mut retries), false)
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::Permission));
        assert_eq!(retries, 0);
    }

    #[test]
    fn test_verify_pin_rejects_long_pin() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        let err = token
            .verify_pin(PinKind::App, Some("123456789"), None, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_change_pin_wrong_pin() {
        let mut token = token_in_txn(vec![sw_only(0x63C2)]);
        let err = token
            .change_pin(PinKind::App, "123456", "654321")
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::Permission));

        // two 8-byte fields, 0xFF padded
        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[4], 16);
        assert_eq!(&cmd[5..13], b"123456\xff\xff");
        assert_eq!(&cmd[13..21], b"654321\xff\xff");
    }

    #[test]
    fn test_reset_pin_blocked_puk() {
        let mut token = token_in_txn(vec![sw_only(0x6983)]);
        let err = token
            .reset_pin(PinKind::App, "12345678", "654321")
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::Permission));
    }

    #[test]
    fn test_sign_prehash_permission_marks_slot() {
        // S6: a PIN-required slot without prior VERIFY fails and flips the
        // slot's PIN requirement on
        let mut token = token_in_txn(vec![sw_only(0x6982)]);
        token.force_slot(SlotId::CardAuthentication, Algorithm::EccP256);
        assert!(!token.slot(SlotId::CardAuthentication).unwrap().auth().pin);

        let err = token
            .sign_prehash(SlotId::CardAuthentication, &[0u8; 32])
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::Permission));
        assert!(token.slot(SlotId::CardAuthentication).unwrap().auth().pin);
    }

    #[test]
    fn test_sign_prehash_parses_signature() {
        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(0x82);
        w.write(&[0xDE, 0xAD, 0xBE, 0xEF]);
        w.pop();
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        token.force_slot(SlotId::Authentication, Algorithm::EccP256);

        let sig = token
            .sign_prehash(SlotId::Authentication, &[0u8; 32])
            .unwrap();
        assert_eq!(sig, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        // template is 7C { 82 (empty), 81 <block> }
        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[1], INS_GEN_AUTH);
        assert_eq!(cmd[2], Algorithm::EccP256.id());
        assert_eq!(cmd[3], 0x9A);
        assert_eq!(&cmd[5..11], &[0x7C, 0x24, 0x82, 0x00, 0x81, 0x20]);
    }

    #[test]
    fn test_sign_rsa_builds_pkcs1_block() {
        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(0x82);
        w.write(&[0x01]);
        w.pop();
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        token.force_slot(SlotId::Signature, Algorithm::Rsa1024);

        let (_, hash) = token.sign(SlotId::Signature, b"hello world", None).unwrap();
        assert_eq!(hash, HashAlgo::Sha256);

        let cmd = &token.transport.commands[0];
        // 7C (long-form length) { 82 empty, 81 (long-form) <128-byte block> }
        assert_eq!(&cmd[5..13], &[0x7C, 0x81, 0x87, 0x82, 0x00, 0x81, 0x81, 0x80]);
        let block = &cmd[13..13 + 128];
        assert_eq!(block[0], 0x00);
        assert_eq!(block[1], 0x01);
        assert!(block[2..block.len() - 52].iter().all(|b| *b == 0xFF));
        let digest = HashAlgo::Sha256.digest(b"hello world");
        assert_eq!(&block[128 - 32..], digest.as_slice());
        assert_eq!(&block[128 - 51..128 - 32], DI_SHA256);
    }

    #[test]
    fn test_sign_hash_on_card_promotes_algorithm() {
        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(0x82);
        w.write(&[0x01]);
        w.pop();
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        token.algs.push(Algorithm::EccP256Sha256);
        token.force_slot(SlotId::Authentication, Algorithm::EccP256);

        let msg = vec![0x55u8; 300];
        let (_, hash) = token.sign(SlotId::Authentication, &msg, None).unwrap();
        assert_eq!(hash, HashAlgo::Sha256);

        // raw message sent (not a digest), under the promoted algorithm id
        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[2], Algorithm::EccP256Sha256.id());
    }

    #[test]
    fn test_admin_auth_three_des() {
        let key = [0x42u8; 24];
        let challenge = [0x10u8, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE];

        let mut w = TlvWriter::new();
        w.push(0x7C);
        w.push(0x81);
        w.write(&challenge);
        w.pop();
        w.pop();

        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000), sw_only(0x9000)]);
        token
            .admin_auth(&key, Algorithm::TripleDes)
            .unwrap();
        assert!(token.must_reset);

        // the response is the challenge encrypted under the admin key
        let mut expected = GenericArray::clone_from_slice(&challenge);
        des::TdesEde3::new_from_slice(&key)
            .unwrap()
            .encrypt_block(&mut expected);

        let step2 = &token.transport.commands[1];
        assert_eq!(&step2[5..9], &[0x7C, 0x0A, 0x82, 0x08]);
        assert_eq!(&step2[9..17], expected.as_slice());
    }

    #[test]
    fn test_admin_auth_no_admin_key() {
        let mut token = token_in_txn(vec![sw_only(0x6A86)]);
        let err = token
            .admin_auth(&[0u8; 24], Algorithm::TripleDes)
            .unwrap_err();
        assert!(err.caused_by(ErrorKind::NotFound));
    }

    #[test]
    fn test_admin_auth_wrong_key_length() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        let err = token
            .admin_auth(&[0u8; 16], Algorithm::TripleDes)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert!(token.transport.commands.is_empty());
    }

    #[test]
    fn test_generate_parses_ec_point() {
        let key = PrivateKey::generate_ec(Curve::P256);
        let point = key.public_key().ec_point().unwrap();

        let mut w = TlvWriter::new();
        w.push(0x7F49);
        w.push(0x86);
        w.write(&point);
        w.pop();
        w.pop();

        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        let pubkey = token
            .generate(SlotId::KeyManagement, Algorithm::EccP256)
            .unwrap();
        assert_eq!(pubkey, key.public_key());

        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[1], INS_GEN_ASYM);
        assert_eq!(cmd[3], 0x9D);
        // AC { 80 <alg> }
        assert_eq!(&cmd[5..10], &[0xAC, 0x03, 0x80, 0x01, 0x11]);
    }

    #[test]
    fn test_ykpiv_generate_writes_policy_tags() {
        let key = PrivateKey::generate_ec(Curve::P256);
        let point = key.public_key().ec_point().unwrap();

        let mut w = TlvWriter::new();
        w.push(0x7F49);
        w.push(0x86);
        w.write(&point);
        w.pop();
        w.pop();

        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        token.ykpiv = true;
        token.ykver = [5, 2, 4];

        token
            .ykpiv_generate(
                SlotId::Authentication,
                Algorithm::EccP256,
                PinPolicy::Once,
                TouchPolicy::Always,
            )
            .unwrap();

        let cmd = &token.transport.commands[0];
        assert_eq!(
            &cmd[5..16],
            &[0xAC, 0x09, 0x80, 0x01, 0x11, 0xAA, 0x01, 0x02, 0xAB, 0x01, 0x02]
        );
    }

    #[test]
    fn test_ykpiv_generate_cached_touch_needs_43() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.ykpiv = true;
        token.ykver = [4, 2, 0];
        let err = token
            .ykpiv_generate(
                SlotId::Authentication,
                Algorithm::EccP256,
                PinPolicy::Default,
                TouchPolicy::Cached,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_import_ec_key() {
        let key = PrivateKey::generate_ec(Curve::P256);
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.ykpiv = true;
        token.ykver = [5, 2, 4];

        token
            .ykpiv_import(
                SlotId::KeyManagement,
                &key,
                PinPolicy::Default,
                TouchPolicy::Default,
            )
            .unwrap();

        let cmd = &token.transport.commands[0];
        assert_eq!(cmd[1], INS_IMPORT_ASYM);
        assert_eq!(cmd[2], Algorithm::EccP256.id());
        assert_eq!(cmd[3], 0x9D);
        assert_eq!(&cmd[5..7], &[0x06, 0x20]);
    }

    #[test]
    fn test_import_out_of_memory() {
        let key = PrivateKey::generate_ec(Curve::P256);
        let mut token = token_in_txn(vec![sw_only(0x6A84)]);
        token.ykpiv = true;
        let err = token
            .ykpiv_import(
                SlotId::KeyManagement,
                &key,
                PinPolicy::Default,
                TouchPolicy::Default,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceOutOfMemory);
    }

    #[test]
    fn test_write_keyhistory_validates_counts() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        let err = token.write_keyhistory(11, 10, Some("https://x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);

        let err = token.write_keyhistory(0, 1, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert!(token.transport.commands.is_empty());
    }

    #[test]
    fn test_write_keyhistory_updates_state() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.write_keyhistory(2, 1, Some("https://certs.example")).unwrap();
        assert_eq!(token.keyhistory_oncard(), 2);
        assert_eq!(token.keyhistory_offcard(), 1);
        assert_eq!(token.keyhistory_url(), Some("https://certs.example"));
    }

    #[test]
    fn test_write_cert_wraps_container() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.write_cert(SlotId::Authentication, &[0x30, 0x03, 0x01, 0x01, 0x00], 0).unwrap();

        let cmd = &token.transport.commands[0];
        // 5C names the 9A cert object
        assert_eq!(&cmd[5..10], &[0x5C, 0x03, 0x5F, 0xC1, 0x05]);
        // 53 { 70 <cert> 71 <certinfo> }
        assert_eq!(&cmd[10..14], &[0x53, 0x0A, 0x70, 0x05]);
    }

    #[test]
    fn test_read_file_unwraps_container() {
        let mut w = TlvWriter::new();
        w.push(0x53);
        w.write(&[0x01, 0x02, 0x03]);
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        let data = token.read_file(0x5FC109).unwrap();
        assert_eq!(data.as_slice(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_attest_requires_ykpiv() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        let err = token.ykpiv_attest(SlotId::Authentication).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_attest_empty_reply_not_supported() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.ykpiv = true;
        let err = token.ykpiv_attest(SlotId::Authentication).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_ykpiv_reset_conditions() {
        let mut token = token_in_txn(vec![sw_only(0x6985)]);
        token.ykpiv = true;
        let err = token.ykpiv_reset().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResetConditions);
    }

    #[test]
    fn test_auth_key_detects_mismatched_key() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.force_slot(SlotId::Authentication, Algorithm::EccP256);
        let other = PrivateKey::generate_ec(Curve::P256);

        // slot has no public key yet
        let err = token
            .auth_key(SlotId::Authentication, &other.public_key())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }
}
