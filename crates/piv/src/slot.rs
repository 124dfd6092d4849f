//! Slot catalog: certificate reads, public key extraction and per-slot
//! authentication requirements
//!
//! Certificates live in PIV data objects as a `53` container holding the
//! DER bytes under `70` and a CertInfo byte under `71`. CertInfo may mark
//! the payload as GZIP-compressed; inflation is capped at
//! [`MAX_CERT_LEN`](crate::consts::MAX_CERT_LEN) bytes.
//!
//! What a slot requires before use (PIN, touch) is learned from YubicoPIV
//! GET METADATA on firmware 5.3 and later, or recovered from the policy
//! extension of an attestation certificate on firmware 4.x.

use std::io::Read;

use der::Decode;
use pivkit_apdu_core::command::CLA_ISO;
use pivkit_apdu_core::CardTransport;
use tracing::{debug, trace};
use x509_cert::Certificate;

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::key::PublicKey;
use crate::tlv::TlvReader;
use crate::token::Token;
use crate::transceive::transceive_chain;
use crate::types::{Algorithm, PinPolicy, SlotAuth, SlotId, TouchPolicy};

/// OID of the YubicoPIV attestation policy extension
const OID_YK_ATTESTATION_POLICY: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("1.3.6.1.4.1.41482.3.8");

/// One key/certificate position on a token
#[derive(Debug, Clone)]
pub struct Slot {
    id: SlotId,
    alg: Option<Algorithm>,
    cert: Option<Certificate>,
    cert_der: Option<Vec<u8>>,
    subject: Option<String>,
    pubkey: Option<PublicKey>,
    auth: SlotAuth,
    got_metadata: bool,
}

impl Slot {
    pub(crate) fn new(id: SlotId) -> Self {
        let auth = match id {
            // Card-auth and attestation keys work without a PIN; everything
            // else requires one until metadata says otherwise.
            SlotId::CardAuthentication | SlotId::Attestation => SlotAuth::default(),
            _ => SlotAuth {
                pin: true,
                touch: false,
            },
        };
        Self {
            id,
            alg: None,
            cert: None,
            cert_der: None,
            subject: None,
            pubkey: None,
            auth,
            got_metadata: false,
        }
    }

    /// The slot identifier
    pub const fn id(&self) -> SlotId {
        self.id
    }

    /// The key algorithm, once learned from metadata or a certificate
    pub const fn algorithm(&self) -> Option<Algorithm> {
        self.alg
    }

    /// The slot's certificate, if read
    pub const fn certificate(&self) -> Option<&Certificate> {
        self.cert.as_ref()
    }

    /// Raw DER of the slot's certificate, if read
    pub fn certificate_der(&self) -> Option<&[u8]> {
        self.cert_der.as_deref()
    }

    /// Subject DN of the certificate, if read
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The slot's public key, if read
    pub const fn public_key(&self) -> Option<&PublicKey> {
        self.pubkey.as_ref()
    }

    /// Authentication requirements learned so far for this slot
    pub const fn auth(&self) -> SlotAuth {
        self.auth
    }

    pub(crate) fn set_algorithm(&mut self, alg: Algorithm) {
        self.alg = Some(alg);
    }

    pub(crate) fn set_pin_required(&mut self, required: bool) {
        self.auth.pin = required;
    }

    pub(crate) fn fuse_policy(&mut self, pin: Option<PinPolicy>, touch: Option<TouchPolicy>) {
        match pin {
            Some(PinPolicy::Once) | Some(PinPolicy::Always) => self.auth.pin = true,
            Some(PinPolicy::Never) => self.auth.pin = false,
            _ => {}
        }
        match touch {
            Some(TouchPolicy::Always) | Some(TouchPolicy::Cached) => self.auth.touch = true,
            Some(TouchPolicy::Never) => self.auth.touch = false,
            _ => {}
        }
    }
}

impl<T: CardTransport> Token<T> {
    /// Read the certificate for `slot_id` and (re)build the slot entry.
    ///
    /// On YubicoPIV 5.3.0 and later the slot's metadata is fetched as well;
    /// metadata failures are swallowed.
    pub fn read_cert(&mut self, slot_id: SlotId) -> Result<()> {
        assert!(self.in_txn, "read_cert requires an open transaction");

        let tag = slot_id.cert_tag()?;
        debug!(slot = %slot_id, "reading cert file");

        let reply = transceive_chain(&mut self.transport, &Self::get_data_cmd(tag))?;

        if reply.is_ok_or_warning() {
            if reply.data.is_empty() {
                return Err(Error::invdata(
                    self.reader_name(),
                    Error::EmptyReply {
                        ins: format!("INS_GET_DATA({slot_id})"),
                    },
                ));
            }

            let reader = self.reader_name().to_string();
            let (der, cert, subject, pubkey, alg) = parse_cert_object(&reply.data, slot_id)
                .map_err(|e| {
                    debug!(
                        reader = %reader,
                        data = %hex::encode(&reply.data),
                        error = %e,
                        "APDU parsing error"
                    );
                    Error::invdata(&reader, e)
                })?;

            let idx = match self.slots.iter().position(|s| s.id() == slot_id) {
                Some(idx) => idx,
                None => {
                    self.slots.push(Slot::new(slot_id));
                    self.slots.len() - 1
                }
            };
            {
                let slot = &mut self.slots[idx];
                slot.alg = Some(alg);
                slot.cert = Some(cert);
                slot.cert_der = Some(der);
                slot.subject = Some(subject);
                slot.pubkey = Some(pubkey);
            }

            if self.ykpiv_version_at_least(5, 3, 0) {
                match self.ykpiv_get_metadata(slot_id) {
                    Ok(()) => {
                        if let Some(slot) = self.slot_mut(slot_id) {
                            slot.got_metadata = true;
                        }
                    }
                    Err(e) => {
                        debug!(slot = %slot_id, error = %e, "getting metadata failed");
                    }
                }
            }

            Ok(())
        } else if reply.sw == pivkit_apdu_core::response::status::common::FILE_NOT_FOUND {
            Err(Error::not_found(
                format!(
                    "no certificate found for slot {slot_id} in device '{}'",
                    self.reader_name()
                ),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else if reply.sw
            == pivkit_apdu_core::response::status::common::SECURITY_STATUS_NOT_SATISFIED
        {
            Err(Error::permission(
                self.reader_name(),
                format!("reading certificate for slot {slot_id}"),
                Error::sw("INS_GET_DATA", reply.sw),
            ))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FUNC_NOT_SUPPORTED
            || reply.sw == pivkit_apdu_core::response::status::common::WRONG_DATA
        {
            Err(Error::not_supported(
                self.reader_name(),
                format!("certificate slot {slot_id}"),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_GET_DATA", reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Read every well-known certificate: card-auth, auth, signing, key
    /// management, then the retired history slots that the Key History
    /// object says are on-card.
    ///
    /// Missing, permission-blocked and unsupported slots are tolerated;
    /// anything else aborts the scan.
    pub fn read_all_certs(&mut self) -> Result<()> {
        assert!(self.in_txn, "read_all_certs requires an open transaction");

        for id in [
            SlotId::CardAuthentication,
            SlotId::Authentication,
            SlotId::Signature,
            SlotId::KeyManagement,
        ] {
            match self.read_cert(id) {
                Ok(()) => {}
                Err(e) if !read_all_aborts_on(&e) => {}
                Err(e) => return Err(e),
            }
        }

        for i in 0..self.keyhistory_oncard().min(20) {
            let id = SlotId::retired(i as u8)?;
            match self.read_cert(id) {
                Ok(()) => {}
                // Retired slots additionally tolerate bare APDU errors;
                // plenty of cards mishandle the higher history objects.
                Err(e) if !read_all_aborts_on(&e) || e.caused_by(ErrorKind::Apdu) => {}
                Err(e) => return Err(e),
            }
        }

        self.did_read_all = true;
        Ok(())
    }

    /// Whether a full catalog scan has completed on this token
    pub const fn did_read_all_certs(&self) -> bool {
        self.did_read_all
    }

    /// Fetch YubicoPIV slot metadata (firmware 5.3.0+) and fuse the PIN and
    /// touch policies into the slot's auth requirements
    pub fn ykpiv_get_metadata(&mut self, slot_id: SlotId) -> Result<()> {
        assert!(self.in_txn);

        if !self.is_ykpiv() {
            return Err(Error::not_ykpiv());
        }
        if !self.ykpiv_version_at_least(5, 3, 0) {
            let v = self.ykver;
            return Err(Error::argument(
                "token",
                "GET_METADATA only on YubicoPIV version >=5.3",
                format!("not supported by this device (v{}.{}.{})", v[0], v[1], v[2]),
            ));
        }
        if self.slot(slot_id).is_none() {
            return Err(Error::argument(
                "slot",
                "a discovered slot on this token",
                format!("{slot_id}"),
            ));
        }

        let cmd =
            pivkit_apdu_core::Command::new(CLA_ISO, INS_GET_METADATA, 0x00, slot_id.to_byte());
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.is_ok_or_warning() {
            let mut alg = None;
            let mut policies = None;

            let mut tlv = TlvReader::new(&reply.data);
            let parsed: Result<()> = (|| {
                while !tlv.at_end() {
                    let tag = tlv.read_tag()?;
                    match tag {
                        0x01 => {
                            if tlv.rem() != 1 {
                                return Err(Error::Length(format!(
                                    "ykpiv metadata tag 0x01 has incorrect length: {}",
                                    tlv.rem()
                                )));
                            }
                            alg = Algorithm::from_id(tlv.read_u8()?);
                            tlv.end()?;
                        }
                        0x02 => {
                            if tlv.rem() != 2 {
                                return Err(Error::Length(format!(
                                    "ykpiv metadata tag 0x02 has incorrect length: {}",
                                    tlv.rem()
                                )));
                            }
                            let pin = tlv.read_u8()?;
                            let touch = tlv.read_u8()?;
                            tlv.end()?;
                            policies =
                                Some((PinPolicy::from_id(pin), TouchPolicy::from_id(touch)));
                        }
                        _ => tlv.skip(),
                    }
                }
                Ok(())
            })();
            parsed.map_err(|e| Error::invdata(self.reader_name(), e))?;

            let slot = self.slot_mut(slot_id).expect("slot checked above");
            if let Some(alg) = alg {
                slot.alg = Some(alg);
            }
            if let Some((pin, touch)) = policies {
                slot.fuse_policy(pin, touch);
            }
            Ok(())
        } else if reply.sw == pivkit_apdu_core::response::status::common::FUNC_NOT_SUPPORTED {
            Err(Error::not_supported(
                self.reader_name(),
                format!("key slot {slot_id}"),
                Some(Error::sw("YK_INS_GET_METADATA", reply.sw)),
            ))
        } else {
            let err = Error::sw("YK_INS_GET_METADATA", reply.sw);
            debug!(reader = %self.reader_name(), error = %err, "unexpected card error");
            Err(err)
        }
    }

    /// Recover PIN and touch policy from the policy extension of the slot's
    /// attestation certificate (YubicoPIV 4.x fallback)
    fn ykpiv_attest_metadata(&mut self, slot_id: SlotId) -> Result<()> {
        let der = self.ykpiv_attest(slot_id)?;

        let cert = Certificate::from_der(&der).map_err(|e| {
            Error::Malformed(format!("bad attestation cert for slot {slot_id}: {e}"))
        })?;

        let ext = cert
            .tbs_certificate
            .extensions
            .as_ref()
            .and_then(|exts| {
                exts.iter()
                    .find(|e| e.extn_id == OID_YK_ATTESTATION_POLICY)
            })
            .ok_or_else(|| Error::invdata(self.reader_name(), Error::ExtensionMissing))?;

        let data = ext.extn_value.as_bytes();
        if data.len() != 2 {
            return Err(Error::invdata(self.reader_name(), Error::ExtensionInvalid));
        }

        trace!(
            pinpol = data[0],
            touchpol = data[1],
            "got policy bytes from attestation cert"
        );

        let slot = self.slot_mut(slot_id).ok_or_else(|| {
            Error::argument("slot", "a discovered slot on this token", format!("{slot_id}"))
        })?;
        slot.fuse_policy(PinPolicy::from_id(data[0]), TouchPolicy::from_id(data[1]));
        Ok(())
    }

    /// Authentication requirements for a slot, fetching metadata (or its
    /// attestation fallback) on first use. Fetch failures are swallowed;
    /// the default mask stands.
    pub fn slot_auth(&mut self, slot_id: SlotId) -> Result<SlotAuth> {
        let slot = self.slot(slot_id).ok_or_else(|| {
            Error::argument("slot", "a discovered slot on this token", format!("{slot_id}"))
        })?;
        if slot.got_metadata {
            return Ok(slot.auth);
        }

        if self.ykpiv_version_at_least(5, 3, 0) {
            match self.ykpiv_get_metadata(slot_id) {
                Ok(()) => {
                    let slot = self.slot_mut(slot_id).expect("slot exists");
                    slot.got_metadata = true;
                    return Ok(slot.auth);
                }
                Err(e) => debug!(error = %e, "getting metadata failed"),
            }
        }

        if self.ykpiv_version_at_least(4, 0, 0) {
            match self.ykpiv_attest_metadata(slot_id) {
                Ok(()) => {
                    let slot = self.slot_mut(slot_id).expect("slot exists");
                    slot.got_metadata = true;
                    return Ok(slot.auth);
                }
                Err(e) => debug!(error = %e, "getting metadata from attestation cert failed"),
            }
        }

        // Don't keep retrying when every path failed.
        let slot = self.slot_mut(slot_id).expect("slot exists");
        slot.got_metadata = true;
        Ok(slot.auth)
    }
}

fn read_all_aborts_on(e: &Error) -> bool {
    !(e.caused_by(ErrorKind::NotFound)
        || e.caused_by(ErrorKind::Permission)
        || e.caused_by(ErrorKind::NotSupported))
}

/// Parse a `53 { 70 cert, 71 certinfo }` container, decompress if flagged,
/// and extract the subject, public key and algorithm
fn parse_cert_object(
    data: &[u8],
    slot_id: SlotId,
) -> Result<(Vec<u8>, Certificate, String, PublicKey, Algorithm)> {
    let mut tlv = TlvReader::new(data);
    let tag = tlv.read_tag()?;
    if tag != 0x53 {
        return Err(Error::tag(format!("INS_GET_DATA({slot_id})"), tag));
    }

    let mut certinfo = 0u8;
    let mut cert_bytes: Option<&[u8]> = None;
    while !tlv.at_end() {
        let tag = tlv.read_tag()?;
        match tag {
            0x71 => {
                certinfo = tlv.read_u8()?;
                tlv.end()?;
            }
            0x70 => {
                cert_bytes = Some(tlv.read_value());
                tlv.end()?;
            }
            _ => tlv.skip(),
        }
    }
    tlv.end()?;

    let cert_bytes = cert_bytes
        .ok_or_else(|| Error::Malformed(format!("certificate object for slot {slot_id} has no 0x70 field")))?;

    // This bit must always be zero, per the NIST PIV spec.
    if certinfo & CI_X509 != 0 {
        return Err(Error::CertFlag(format!(
            "certificate for slot {slot_id} has PIV_CI_X509 flag set, not allowed by spec"
        )));
    }

    let der: Vec<u8> = match certinfo & CI_COMPTYPE {
        CI_COMP_GZIP => {
            let mut out = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(cert_bytes).take(MAX_CERT_LEN as u64 + 1);
            decoder.read_to_end(&mut out).map_err(|_| {
                Error::Decompression(format!(
                    "compressed cert in slot {slot_id} failed to decompress"
                ))
            })?;
            if out.len() > MAX_CERT_LEN {
                return Err(Error::Decompression(format!(
                    "compressed cert in slot {slot_id} was too big ({} bytes)",
                    out.len()
                )));
            }
            debug!(
                compressed_len = cert_bytes.len(),
                uncompressed_len = out.len(),
                "decompressed cert"
            );
            out
        }
        CI_COMP_NONE => cert_bytes.to_vec(),
        _ => {
            return Err(Error::CertFlag(format!(
                "certificate for slot {slot_id} has unknown compression type flag"
            )));
        }
    };

    let cert = Certificate::from_der(&der)
        .map_err(|e| Error::Malformed(format!("bad certificate for slot {slot_id}: {e}")))?;
    let subject = cert.tbs_certificate.subject.to_string();
    let pubkey = PublicKey::from_spki(&cert.tbs_certificate.subject_public_key_info)?;
    let alg = pubkey.algorithm()?;

    Ok((der, cert, subject, pubkey, alg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TlvWriter;
    use bytes::Bytes;
    use pivkit_apdu_core::transport::MockTransport;
    use std::io::Write;

    fn test_cert_der() -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["piv-unit-test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        cert.der().to_vec()
    }

    fn cert_object(cert: &[u8], certinfo: u8) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.push(0x53);
        w.push(0x70);
        w.write(cert);
        w.pop();
        w.push(0x71);
        w.write_byte(certinfo);
        w.pop();
        w.pop();
        w.finish()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn with_sw(mut body: Vec<u8>, sw: u16) -> Bytes {
        body.extend_from_slice(&sw.to_be_bytes());
        Bytes::from(body)
    }

    fn token_in_txn(responses: Vec<Bytes>) -> Token<MockTransport> {
        let mut token = Token::new(MockTransport::new(responses));
        token.txn_begin().unwrap();
        token
    }

    #[test]
    fn test_read_cert_plain() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&der, 0x00), 0x9000)]);
        token.read_cert(SlotId::Authentication).unwrap();

        let slot = token.slot(SlotId::Authentication).unwrap();
        assert_eq!(slot.algorithm(), Some(Algorithm::EccP256));
        assert!(slot.public_key().is_some());
        assert_eq!(slot.certificate_der(), Some(der.as_slice()));
        assert!(slot.auth().pin);
        assert!(!slot.auth().touch);
    }

    #[test]
    fn test_read_cert_gzip() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&gzip(&der), 0x01), 0x9000)]);
        token.read_cert(SlotId::KeyManagement).unwrap();
        assert_eq!(
            token.slot(SlotId::KeyManagement).unwrap().certificate_der(),
            Some(der.as_slice())
        );
    }

    #[test]
    fn test_read_cert_card_auth_needs_no_pin() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&der, 0x00), 0x9000)]);
        token.read_cert(SlotId::CardAuthentication).unwrap();
        assert!(!token.slot(SlotId::CardAuthentication).unwrap().auth().pin);
    }

    #[test]
    fn test_read_cert_replaces_slot_in_place() {
        let der = test_cert_der();
        let obj = cert_object(&der, 0x00);
        let mut token = token_in_txn(vec![
            with_sw(obj.clone(), 0x9000),
            with_sw(cert_object(&der, 0x00), 0x9000),
            with_sw(obj, 0x9000),
        ]);
        token.read_cert(SlotId::CardAuthentication).unwrap();
        token.read_cert(SlotId::Authentication).unwrap();
        token.read_cert(SlotId::CardAuthentication).unwrap();

        let order: Vec<SlotId> = token.slots().map(Slot::id).collect();
        assert_eq!(
            order,
            vec![SlotId::CardAuthentication, SlotId::Authentication]
        );
    }

    #[test]
    fn test_read_cert_rejects_x509_flag() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&der, 0x04), 0x9000)]);
        let err = token.read_cert(SlotId::Authentication).unwrap_err();
        assert!(err.caused_by(ErrorKind::CertFlag));
    }

    #[test]
    fn test_read_cert_decompression_cap() {
        // inflates past the 16 KiB certificate ceiling
        let big = vec![0u8; MAX_CERT_LEN + 1];
        let mut token = token_in_txn(vec![with_sw(cert_object(&gzip(&big), 0x01), 0x9000)]);
        let err = token.read_cert(SlotId::Authentication).unwrap_err();
        assert!(err.caused_by(ErrorKind::Decompression));
    }

    #[test]
    fn test_read_cert_decompression_at_cap_ok() {
        // exactly 16 KiB is accepted (and then fails DER parse, not the cap)
        let at_cap = vec![0u8; MAX_CERT_LEN];
        let mut token = token_in_txn(vec![with_sw(cert_object(&gzip(&at_cap), 0x01), 0x9000)]);
        let err = token.read_cert(SlotId::Authentication).unwrap_err();
        assert!(!err.caused_by(ErrorKind::Decompression));
        assert!(err.caused_by(ErrorKind::InvalidData));
    }

    #[test]
    fn test_read_cert_not_found() {
        let mut token = token_in_txn(vec![Bytes::from_static(&[0x6A, 0x82])]);
        let err = token.read_cert(SlotId::Signature).unwrap_err();
        assert!(err.caused_by(ErrorKind::NotFound));
        assert!(token.slot(SlotId::Signature).is_none());
    }

    #[test]
    fn test_metadata_fusion() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&der, 0x00), 0x9000)]);
        token.read_cert(SlotId::Authentication).unwrap();

        token.ykpiv = true;
        token.ykver = [5, 4, 2];

        // pin policy NEVER, touch policy CACHED
        let mut w = TlvWriter::new();
        w.push(0x01);
        w.write_byte(Algorithm::EccP256.id());
        w.pop();
        w.push(0x02);
        w.write_byte(0x01);
        w.write_byte(0x03);
        w.pop();
        token.transport.responses = vec![with_sw(w.finish(), 0x9000)];

        token.ykpiv_get_metadata(SlotId::Authentication).unwrap();
        let auth = token.slot(SlotId::Authentication).unwrap().auth();
        assert!(!auth.pin);
        assert!(auth.touch);
    }

    #[test]
    fn test_metadata_requires_recent_firmware() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![with_sw(cert_object(&der, 0x00), 0x9000)]);
        token.read_cert(SlotId::Authentication).unwrap();

        token.ykpiv = true;
        token.ykver = [4, 3, 0];
        let err = token.ykpiv_get_metadata(SlotId::Authentication).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_read_all_certs_tolerates_missing() {
        let der = test_cert_der();
        let mut token = token_in_txn(vec![
            Bytes::from_static(&[0x6A, 0x82]),           // 9E absent
            with_sw(cert_object(&der, 0x00), 0x9000),    // 9A
            Bytes::from_static(&[0x6A, 0x82]),           // 9C absent
            Bytes::from_static(&[0x69, 0x82]),           // 9D needs auth
        ]);
        token.read_all_certs().unwrap();
        assert!(token.did_read_all_certs());
        assert_eq!(token.slots().count(), 1);
    }
}
