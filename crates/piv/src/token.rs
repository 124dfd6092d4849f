//! PIV token state and lifecycle
//!
//! A [`Token`] owns one open reader channel and tracks everything learned
//! about the card behind it: CHUID identity, supported algorithms,
//! authentication methods, key history, YubicoPIV capabilities and the slot
//! catalog. [`enumerate`] and [`find`] materialize tokens from the readers
//! attached to the system.

use bytes::Bytes;
use pivkit_apdu_core::command::CLA_ISO;
use pivkit_apdu_core::CardTransport;
use pivkit_apdu_pcsc::{PcscDeviceManager, PcscError, PcscTransport};
use sha2::Digest;
use tracing::{debug, warn};

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::slot::Slot;
use crate::tlv::{TlvReader, TlvWriter};
use crate::transceive::{transceive_chain, Reply};
use crate::types::{Algorithm, PinKind, SlotId};

/// A connected PIV card
#[derive(Debug)]
pub struct Token<T: CardTransport> {
    pub(crate) transport: T,
    reader_name: String,

    pub(crate) in_txn: bool,
    pub(crate) must_reset: bool,

    pub(crate) guid: [u8; GUID_LEN],
    pub(crate) has_chuid: bool,
    signed_chuid: bool,
    fascn: Vec<u8>,
    expiry: [u8; 8],
    chuuid: Option<[u8; GUID_LEN]>,

    pub(crate) algs: Vec<Algorithm>,

    hist_oncard: u32,
    hist_offcard: u32,
    hist_url: Option<String>,

    app_label: Option<String>,
    app_uri: Option<String>,

    auth: PinKind,
    pin_app: bool,
    pin_global: bool,
    occ: bool,
    vci: bool,

    pub(crate) slots: Vec<Slot>,
    pub(crate) did_read_all: bool,

    pub(crate) ykpiv: bool,
    pub(crate) ykver: [u8; 3],
    ykserial: Option<u32>,
}

impl<T: CardTransport> Token<T> {
    /// Wrap an open reader channel in a fresh, unprobed token
    pub fn new(transport: T) -> Self {
        let reader_name = transport.reader_name().to_string();
        Self {
            transport,
            reader_name,
            in_txn: false,
            must_reset: false,
            guid: [0; GUID_LEN],
            has_chuid: false,
            signed_chuid: false,
            fascn: Vec::new(),
            expiry: [0; 8],
            chuuid: None,
            algs: Vec::new(),
            hist_oncard: 0,
            hist_offcard: 0,
            hist_url: None,
            app_label: None,
            app_uri: None,
            auth: PinKind::App,
            pin_app: false,
            pin_global: false,
            occ: false,
            vci: false,
            slots: Vec::new(),
            did_read_all: false,
            ykpiv: false,
            ykver: [0; 3],
            ykserial: None,
        }
    }

    /// Name of the reader this token is attached to
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Whether a transaction is currently open
    pub const fn in_txn(&self) -> bool {
        self.in_txn
    }

    /// Card GUID from the CHUID (possibly synthesized); absent when the
    /// card has no CHUID or the CHUID carries no usable identity
    pub fn guid(&self) -> Option<&[u8; GUID_LEN]> {
        if self.has_chuid && self.guid != [0; GUID_LEN] {
            Some(&self.guid)
        } else {
            None
        }
    }

    /// Hex form of the card GUID
    pub fn guid_hex(&self) -> Option<String> {
        self.guid().map(hex::encode)
    }

    /// FASC-N bytes from the CHUID
    pub fn fascn(&self) -> Option<&[u8]> {
        if self.fascn.is_empty() {
            None
        } else {
            Some(&self.fascn)
        }
    }

    /// Card expiry from the CHUID, `YYYYMMDD`
    pub fn expiry(&self) -> Option<&[u8; 8]> {
        if self.has_chuid {
            Some(&self.expiry)
        } else {
            None
        }
    }

    /// Cardholder UUID from the CHUID
    pub fn chuuid(&self) -> Option<&[u8; GUID_LEN]> {
        if self.has_chuid {
            self.chuuid.as_ref()
        } else {
            None
        }
    }

    /// Whether the card has a CHUID object
    pub const fn has_chuid(&self) -> bool {
        self.has_chuid
    }

    /// Whether the CHUID carries an asymmetric signature
    pub const fn has_signed_chuid(&self) -> bool {
        self.signed_chuid
    }

    /// Algorithms advertised in the answer to SELECT (often empty)
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algs
    }

    /// The preferred authentication method for this card
    pub const fn default_auth(&self) -> PinKind {
        self.auth
    }

    /// Whether the card supports the given authentication method
    pub const fn has_auth(&self, auth: PinKind) -> bool {
        match auth {
            PinKind::App => self.pin_app,
            PinKind::Global => self.pin_global,
            PinKind::Occ => self.occ,
        }
    }

    /// Whether the card supports the virtual contact interface
    pub const fn has_vci(&self) -> bool {
        self.vci
    }

    /// Number of retired keys with certificates on-card
    pub const fn keyhistory_oncard(&self) -> u32 {
        self.hist_oncard
    }

    /// Number of retired keys with certificates held off-card
    pub const fn keyhistory_offcard(&self) -> u32 {
        self.hist_offcard
    }

    /// URL where off-card certificates can be retrieved
    pub fn keyhistory_url(&self) -> Option<&str> {
        self.hist_url.as_deref()
    }

    /// Application label from the answer to SELECT
    pub fn app_label(&self) -> Option<&str> {
        self.app_label.as_deref()
    }

    /// Application URI from the answer to SELECT
    pub fn app_uri(&self) -> Option<&str> {
        self.app_uri.as_deref()
    }

    /// Whether the card answers to the YubicoPIV extensions
    pub const fn is_ykpiv(&self) -> bool {
        self.ykpiv
    }

    /// YubicoPIV firmware version, if the card is a YubiKey
    pub fn ykpiv_version(&self) -> Option<[u8; 3]> {
        self.ykpiv.then_some(self.ykver)
    }

    /// YubiKey serial number (firmware 5 and later)
    pub fn ykpiv_serial(&self) -> Option<u32> {
        if self.ykpiv {
            self.ykserial
        } else {
            None
        }
    }

    /// Whether this is a YubicoPIV card of at least the given version
    pub fn ykpiv_version_at_least(&self, major: u8, minor: u8, patch: u8) -> bool {
        self.ykpiv && self.ykver >= [major, minor, patch]
    }

    /// Slots discovered so far, in discovery order
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Look up a discovered slot
    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id() == id)
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id() == id)
    }

    /// Insert or overwrite a slot entry with a caller-asserted algorithm,
    /// for keys that have no certificate on the card yet
    pub fn force_slot(&mut self, id: SlotId, alg: Algorithm) -> &Slot {
        let idx = match self.slots.iter().position(|s| s.id() == id) {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::new(id));
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[idx];
        slot.set_algorithm(alg);
        slot
    }

    /// Begin an exclusive transaction on the card.
    ///
    /// All APDU-issuing operations require an open transaction. A card
    /// reset during acquisition is retried once by the transport.
    pub fn txn_begin(&mut self) -> Result<()> {
        assert!(!self.in_txn, "transaction already open");
        self.transport
            .begin_transaction()
            .map_err(|e| Error::io(&self.reader_name, Error::Pcsc(e)))?;
        self.in_txn = true;
        Ok(())
    }

    /// End the transaction, resetting the card if an authentication-state
    /// change demands it. Release failures are logged, never propagated.
    pub fn txn_end(&mut self) {
        assert!(self.in_txn, "no open transaction");
        if let Err(e) = self.transport.end_transaction(self.must_reset) {
            warn!(reader = %self.reader_name, error = %e, "failed to end transaction");
        }
        self.in_txn = false;
        self.must_reset = false;
    }

    pub(crate) fn get_data_cmd(tag: u32) -> pivkit_apdu_core::Command {
        let mut w = TlvWriter::new();
        w.push(0x5C);
        w.write_uint(tag);
        w.pop();
        pivkit_apdu_core::Command::new_with_data(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, w.finish())
    }

    fn invdata(&self, reply: &Reply, cause: Error) -> Error {
        debug!(
            reader = %self.reader_name,
            data = %hex::encode(&reply.data),
            error = %cause,
            "APDU parsing error"
        );
        Error::invdata(&self.reader_name, cause)
    }

    /// Select the PIV application and parse its property template.
    ///
    /// Selecting twice in a session is idempotent: an already-populated
    /// algorithm list is left untouched.
    pub fn select(&mut self) -> Result<()> {
        assert!(self.in_txn, "select requires an open transaction");

        let cmd = pivkit_apdu_core::Command::new_with_data(
            CLA_ISO,
            INS_SELECT,
            SEL_APP_AID,
            0,
            Bytes::from_static(&AID_PIV),
        );
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if !(reply.sw.is_success()
            || reply.sw == pivkit_apdu_core::response::status::common::WARNING_EOF)
        {
            let err = Error::not_found(
                format!("PIV applet was not found on device '{}'", self.reader_name),
                Some(Error::sw("INS_SELECT", reply.sw)),
            );
            debug!(reader = %self.reader_name, error = %err, "card did not accept INS_SELECT for PIV");
            return Err(err);
        }

        self.parse_apt(&reply).map_err(|e| self.invdata(&reply, e))
    }

    fn parse_apt(&mut self, reply: &Reply) -> Result<()> {
        let mut tlv = TlvReader::new(&reply.data);
        let tag = tlv.read_tag()?;
        if tag != PIV_TAG_APT {
            return Err(Error::tag("INS_SELECT", tag));
        }

        let mut extra_apt = false;
        while !tlv.at_end() {
            let tag = tlv.read_tag()?;
            match tag {
                PIV_TAG_APT => {
                    // Some cards wrap the template in a second APT.
                    extra_apt = true;
                }
                PIV_TAG_AID | PIV_TAG_AUTHORITY => tlv.skip(),
                PIV_TAG_APP_LABEL => {
                    self.app_label = Some(tlv.read_string()?);
                    tlv.end()?;
                }
                PIV_TAG_URI => {
                    self.app_uri = Some(tlv.read_string()?);
                    tlv.end()?;
                }
                PIV_TAG_ALGS => {
                    if !self.algs.is_empty() {
                        tlv.skip();
                        continue;
                    }
                    while !tlv.at_end() {
                        let tag = tlv.read_tag()?;
                        if tag == 0x80 {
                            let id = tlv.read_uint()?;
                            match u8::try_from(id).ok().and_then(Algorithm::from_id) {
                                Some(alg) if self.algs.len() < 32 => self.algs.push(alg),
                                Some(_) => {}
                                None => {
                                    debug!(id, "ignoring unknown algorithm in SELECT response")
                                }
                            }
                            tlv.end()?;
                        } else if tag == 0x06 {
                            tlv.skip();
                        } else {
                            return Err(Error::tag("algo list in INS_SELECT", tag));
                        }
                    }
                    tlv.end()?;
                }
                other => return Err(Error::tag("INS_SELECT", other)),
            }
        }
        if extra_apt {
            tlv.end()?;
        }
        tlv.end()?;
        Ok(())
    }

    /// Read and parse the Card Holder Unique Identifier object
    pub(crate) fn read_chuid(&mut self) -> Result<()> {
        assert!(self.in_txn);

        debug!(reader = %self.reader_name, "reading CHUID file");
        let reply = transceive_chain(&mut self.transport, &Self::get_data_cmd(TAG_CHUID))?;

        if reply.is_ok_or_warning() {
            self.parse_chuid(&reply).map_err(|e| self.invdata(&reply, e))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FILE_NOT_FOUND
            || reply.sw == pivkit_apdu_core::response::status::common::WRONG_DATA
        {
            Err(Error::not_found(
                format!("PIV CHUID object was not found on device '{}'", self.reader_name),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_GET_DATA(CHUID)", reply.sw);
            debug!(reader = %self.reader_name, error = %err, "unexpected card error");
            Err(err)
        }
    }

    fn parse_chuid(&mut self, reply: &Reply) -> Result<()> {
        let mut tlv = TlvReader::new(&reply.data);
        let tag = tlv.read_tag()?;
        if tag != 0x53 {
            return Err(Error::tag("INS_GET_DATA(CHUID)", tag));
        }

        while !tlv.at_end() {
            let tag = tlv.read_tag()?;
            match tag {
                0x30 => {
                    // FASC-N
                    let v = tlv.read_value();
                    if v.len() > 26 {
                        return Err(Error::Length(format!(
                            "CHUID FASC-N of {} bytes exceeds the 26 byte maximum",
                            v.len()
                        )));
                    }
                    self.fascn = v.to_vec();
                    tlv.end()?;
                }
                0x32 | 0x33 | 0xEE | 0xFE => tlv.skip(),
                0x35 => {
                    let v = tlv.read_bytes(8)?;
                    self.expiry.copy_from_slice(v);
                    tlv.end()?;
                }
                0x36 => {
                    let v = tlv.read_bytes(GUID_LEN)?;
                    let mut chuuid = [0u8; GUID_LEN];
                    chuuid.copy_from_slice(v);
                    self.chuuid = Some(chuuid);
                    tlv.end()?;
                }
                0x3E => {
                    if tlv.rem() > 0 {
                        self.signed_chuid = true;
                    }
                    tlv.skip();
                }
                0x34 => {
                    let v = tlv.read_bytes(GUID_LEN)?;
                    self.guid.copy_from_slice(v);
                    tlv.end()?;
                }
                other => return Err(Error::tag("INS_GET_DATA(CHUID)", other)),
            }
        }
        tlv.end()?;

        // An all-zero GUID falls back to the cardholder UUID, and failing
        // that to a digest of the FASC-N.
        if self.guid == [0; GUID_LEN] {
            if let Some(chuuid) = self.chuuid {
                self.guid = chuuid;
            }
            if self.guid == [0; GUID_LEN] && !self.fascn.is_empty() {
                let digest = sha2::Sha256::digest(&self.fascn);
                self.guid.copy_from_slice(&digest[..GUID_LEN]);
            }
        }

        self.has_chuid = true;
        Ok(())
    }

    /// Read and parse the PIV Discovery Object
    pub(crate) fn read_discov(&mut self) -> Result<()> {
        assert!(self.in_txn);

        let reply = transceive_chain(&mut self.transport, &Self::get_data_cmd(TAG_DISCOV))?;

        if reply.is_ok_or_warning() {
            self.parse_discov(&reply).map_err(|e| self.invdata(&reply, e))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FILE_NOT_FOUND
            || reply.sw == pivkit_apdu_core::response::status::common::WRONG_DATA
        {
            Err(Error::not_found(
                format!("PIV discovery object was not found on device '{}'", self.reader_name),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FUNC_NOT_SUPPORTED {
            Err(Error::not_supported(
                &self.reader_name,
                "PIV discovery object",
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_GET_DATA(DISCOV)", reply.sw);
            debug!(reader = %self.reader_name, error = %err, "unexpected card error");
            Err(err)
        }
    }

    fn parse_discov(&mut self, reply: &Reply) -> Result<()> {
        let mut tlv = TlvReader::new(&reply.data);
        let tag = tlv.read_tag()?;
        if tag != 0x7E {
            return Err(Error::tag("INS_GET_DATA(DISCOV)", tag));
        }

        while !tlv.at_end() {
            let tag = tlv.read_tag()?;
            match tag {
                0x4F => {
                    let v = tlv.read_value();
                    if v.len() > AID_PIV.len() || v != &AID_PIV[..v.len()] {
                        return Err(Error::Malformed(
                            "PIV discovery AID tag contained incorrect AID".into(),
                        ));
                    }
                    tlv.end()?;
                }
                0x5F2F => {
                    // PIN usage policy, SP 800-73-4 part 1 section 3.3.2
                    let policy = tlv.read_uint()?;
                    debug!(policy, "policy in discovery object");
                    if policy & 0x4000 != 0 {
                        self.pin_app = true;
                    }
                    if policy & 0x2000 != 0 {
                        self.pin_global = true;
                    }
                    if policy & 0x1000 != 0 {
                        self.occ = true;
                    }
                    if policy & 0x0800 != 0 {
                        self.vci = true;
                    }

                    if self.pin_app {
                        self.auth = PinKind::App;
                    } else if self.pin_global {
                        self.auth = PinKind::Global;
                    } else if self.occ {
                        self.auth = PinKind::Occ;
                    }

                    if policy & 0xFF == 0x10 {
                        self.auth = PinKind::App;
                    }
                    if policy & 0xFF == 0x20 && self.pin_global {
                        self.auth = PinKind::Global;
                    }
                    tlv.end()?;
                }
                other => return Err(Error::tag("INS_GET_DATA(DISCOV)", other)),
            }
        }
        tlv.end()?;
        Ok(())
    }

    /// Read and parse the Key History object
    pub(crate) fn read_keyhist(&mut self) -> Result<()> {
        assert!(self.in_txn);

        let reply = transceive_chain(&mut self.transport, &Self::get_data_cmd(TAG_KEYHIST))?;

        if reply.is_ok_or_warning() {
            if reply.data.is_empty() {
                return Err(self.invdata(
                    &reply,
                    Error::EmptyReply {
                        ins: "INS_GET_DATA(KEYHIST)".into(),
                    },
                ));
            }
            self.parse_keyhist(&reply)
                .map_err(|e| self.invdata(&reply, e))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FILE_NOT_FOUND
            || reply.sw == pivkit_apdu_core::response::status::common::WRONG_DATA
        {
            Err(Error::not_found(
                format!("PIV key history object was not found on device '{}'", self.reader_name),
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else if reply.sw == pivkit_apdu_core::response::status::common::FUNC_NOT_SUPPORTED {
            Err(Error::not_supported(
                &self.reader_name,
                "PIV key history object",
                Some(Error::sw("INS_GET_DATA", reply.sw)),
            ))
        } else {
            let err = Error::sw("INS_GET_DATA(KEYHIST)", reply.sw);
            debug!(reader = %self.reader_name, error = %err, "unexpected card error");
            Err(err)
        }
    }

    fn parse_keyhist(&mut self, reply: &Reply) -> Result<()> {
        let mut tlv = TlvReader::new(&reply.data);
        let tag = tlv.read_tag()?;
        if tag != 0x53 {
            return Err(Error::tag("INS_GET_DATA(KEYHIST)", tag));
        }

        while !tlv.at_end() {
            let tag = tlv.read_tag()?;
            match tag {
                0xC1 => {
                    self.hist_oncard = tlv.read_uint()?;
                    tlv.end()?;
                }
                0xC2 => {
                    self.hist_offcard = tlv.read_uint()?;
                    tlv.end()?;
                }
                0xF3 => {
                    self.hist_url = Some(tlv.read_string()?);
                    tlv.end()?;
                }
                0xFE => tlv.skip(),
                other => return Err(Error::tag("INS_GET_DATA(KEYHIST)", other)),
            }
        }
        tlv.end()?;
        Ok(())
    }

    pub(crate) fn set_keyhist(&mut self, oncard: u32, offcard: u32, url: Option<&str>) {
        self.hist_oncard = oncard;
        self.hist_offcard = offcard;
        self.hist_url = url.map(str::to_string);
    }

    /// Probe for the YubicoPIV GET VERSION extension. A card that answers
    /// is treated as YubicoPIV-capable for all other vendor commands.
    pub(crate) fn ykpiv_get_version(&mut self) -> Result<()> {
        assert!(self.in_txn);

        let cmd = pivkit_apdu_core::Command::new(CLA_ISO, INS_GET_VER, 0x00, 0x00);
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            if reply.data.len() < 3 {
                return Err(Error::not_supported(&self.reader_name, "YubicoPIV", None));
            }
            self.ykpiv = true;
            self.ykver.copy_from_slice(&reply.data[..3]);
            Ok(())
        } else {
            Err(Error::not_supported(
                &self.reader_name,
                "YubicoPIV",
                Some(Error::sw("INS_YK_GET_VER", reply.sw)),
            ))
        }
    }

    /// Read the YubiKey serial number (YubicoPIV 5.0.0 and later)
    pub(crate) fn ykpiv_read_serial(&mut self) -> Result<()> {
        assert!(self.in_txn);

        let cmd = pivkit_apdu_core::Command::new(CLA_ISO, INS_GET_SERIAL, 0x00, 0x00);
        let reply = transceive_chain(&mut self.transport, &cmd)?;

        if reply.sw.is_success() {
            if reply.data.len() < 4 {
                return Err(Error::not_supported(&self.reader_name, "YubicoPIV v5", None));
            }
            self.ykserial = Some(u32::from_be_bytes([
                reply.data[0],
                reply.data[1],
                reply.data[2],
                reply.data[3],
            ]));
            Ok(())
        } else {
            Err(Error::not_supported(
                &self.reader_name,
                "YubicoPIV v5",
                Some(Error::sw("INS_YK_GET_SERIAL", reply.sw)),
            ))
        }
    }

    /// Discovery preset run under an open transaction after SELECT: each
    /// optional object is tolerated when absent or unsupported.
    pub(crate) fn probe(&mut self) -> Result<()> {
        self.select()?;

        match self.read_chuid() {
            Ok(()) => {}
            Err(e) if e.caused_by(ErrorKind::NotFound) => {
                self.has_chuid = false;
            }
            Err(e) => return Err(e),
        }

        match self.read_discov() {
            Ok(()) => {}
            Err(e)
                if e.caused_by(ErrorKind::NotFound) || e.caused_by(ErrorKind::NotSupported) =>
            {
                // No discovery object: prefer the application PIN.
                self.pin_app = true;
                self.auth = PinKind::App;
            }
            Err(e) => return Err(e),
        }

        match self.read_keyhist() {
            Ok(()) => {}
            Err(e)
                if e.caused_by(ErrorKind::NotFound) || e.caused_by(ErrorKind::NotSupported) => {}
            Err(e) => return Err(e),
        }

        match self.ykpiv_get_version() {
            Ok(()) => {
                if self.ykpiv_version_at_least(5, 0, 0) {
                    match self.ykpiv_read_serial() {
                        Ok(()) => {}
                        Err(e) if e.caused_by(ErrorKind::NotSupported) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.caused_by(ErrorKind::NotSupported) => {}
            Err(e) => return Err(e),
        }

        Ok(())
    }
}

/// Enumerate all PIV tokens attached to the system.
///
/// Readers whose card cannot be probed (no card, SELECT refused, transport
/// trouble) are logged and dropped from the result, never raised.
pub fn enumerate(manager: &PcscDeviceManager) -> Result<Vec<Token<PcscTransport>>> {
    let readers = manager.list_readers().map_err(map_manager_err)?;

    let mut tokens = Vec::new();
    for reader in readers {
        let transport = match manager.open_reader(reader.name()) {
            Ok(t) => t,
            Err(e) => {
                debug!(reader = reader.name(), error = %e, "failed to connect reader");
                continue;
            }
        };
        if !transport.is_connected() {
            continue;
        }

        let mut token = Token::new(transport);
        if let Err(e) = token.txn_begin() {
            debug!(reader = reader.name(), error = %e, "failed to begin transaction");
            continue;
        }
        let probed = token.probe();
        token.txn_end();

        match probed {
            Ok(()) => tokens.push(token),
            Err(e) => {
                debug!(reader = reader.name(), error = %e, "eliminated reader due to error");
            }
        }
    }

    Ok(tokens)
}

/// Find the single token whose GUID starts with `guid`.
///
/// An empty `guid` matches only cards without a CHUID, and only if exactly
/// one such card is attached. More than one match yields
/// [`Error::Duplicate`]; none, [`ErrorKind::NotFound`].
pub fn find(manager: &PcscDeviceManager, guid: &[u8]) -> Result<Token<PcscTransport>> {
    if guid.len() > GUID_LEN {
        return Err(Error::argument(
            "guid",
            format!("at most {GUID_LEN} bytes"),
            format!("{} bytes", guid.len()),
        ));
    }

    let readers = manager.list_readers().map_err(map_manager_err)?;

    // The winning candidate keeps its transaction open until its remaining
    // objects are read below.
    let mut found: Option<Token<PcscTransport>> = None;

    for reader in readers {
        let transport = match manager.open_reader(reader.name()) {
            Ok(t) => t,
            Err(e) => {
                debug!(reader = reader.name(), error = %e, "failed to connect reader");
                continue;
            }
        };
        if !transport.is_connected() {
            continue;
        }

        let mut token = Token::new(transport);
        if token.txn_begin().is_err() {
            continue;
        }
        if let Err(e) = token.select() {
            debug!(reader = reader.name(), error = %e, "eliminated reader due to error");
            token.txn_end();
            continue;
        }

        let matched = match token.read_chuid() {
            Ok(()) => !guid.is_empty() && token.guid[..guid.len()] == *guid,
            Err(e) if e.caused_by(ErrorKind::NotFound) && guid.is_empty() => {
                token.has_chuid = false;
                true
            }
            Err(e) => {
                debug!(reader = reader.name(), error = %e, "eliminated reader due to error");
                token.txn_end();
                continue;
            }
        };

        if !matched {
            token.txn_end();
            continue;
        }
        if let Some(mut prev) = found.take() {
            prev.txn_end();
            token.txn_end();
            return Err(Error::Duplicate);
        }
        found = Some(token);
    }

    let mut token = match found {
        Some(t) => t,
        None => return Err(Error::not_found("no PIV token found matching GUID", None)),
    };

    let finish = |token: &mut Token<PcscTransport>| -> Result<()> {
        match token.read_discov() {
            Ok(()) => {}
            Err(e)
                if e.caused_by(ErrorKind::NotFound) || e.caused_by(ErrorKind::NotSupported) =>
            {
                token.pin_app = true;
                token.auth = PinKind::App;
            }
            Err(e) => return Err(e),
        }
        match token.read_keyhist() {
            Ok(()) => {}
            Err(e)
                if e.caused_by(ErrorKind::NotFound) || e.caused_by(ErrorKind::NotSupported) => {}
            Err(e) => return Err(e),
        }
        match token.ykpiv_get_version() {
            Ok(()) => {
                if token.ykpiv_version_at_least(5, 0, 0) {
                    match token.ykpiv_read_serial() {
                        Ok(()) => {}
                        Err(e) if e.caused_by(ErrorKind::NotSupported) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.caused_by(ErrorKind::NotSupported) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    };

    let finished = finish(&mut token);
    token.txn_end();
    finished?;

    Ok(token)
}

fn map_manager_err(e: PcscError) -> Error {
    match e {
        PcscError::Context(_) => Error::PcscContext(e.into()),
        other => Error::Pcsc(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivkit_apdu_core::transport::MockTransport;

    fn sw_only(sw: u16) -> Bytes {
        Bytes::from(sw.to_be_bytes().to_vec())
    }

    fn with_sw(mut body: Vec<u8>, sw: u16) -> Bytes {
        body.extend_from_slice(&sw.to_be_bytes());
        Bytes::from(body)
    }

    /// Minimal application property template
    fn apt_reply() -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.push(0x61);
        w.push(0x4F);
        w.write(&AID_PIV[..9]);
        w.pop();
        w.push(0x50);
        w.write(b"PivApplet");
        w.pop();
        w.push(0xAC);
        w.push(0x80);
        w.write_byte(0x11);
        w.pop();
        w.push(0x80);
        w.write_byte(0x14);
        w.pop();
        w.push(0x06);
        w.write_byte(0x00);
        w.pop();
        w.pop();
        w.pop();
        w.finish()
    }

    fn chuid_reply(guid: [u8; 16], fascn: &[u8], chuuid: Option<[u8; 16]>) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.push(0x53);
        w.push(0x30);
        w.write(fascn);
        w.pop();
        w.push(0x34);
        w.write(&guid);
        w.pop();
        if let Some(chuuid) = chuuid {
            w.push(0x36);
            w.write(&chuuid);
            w.pop();
        }
        w.push(0x35);
        w.write(b"20300101");
        w.pop();
        w.push(0x3E);
        w.pop();
        w.pop();
        w.finish()
    }

    fn discov_reply(policy: u16) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.push(0x7E);
        w.push(0x4F);
        w.write(&AID_PIV[..9]);
        w.pop();
        w.push(0x5F2F);
        w.write(&policy.to_be_bytes());
        w.pop();
        w.pop();
        w.finish()
    }

    fn token_in_txn(responses: Vec<Bytes>) -> Token<MockTransport> {
        let mut token = Token::new(MockTransport::new(responses));
        token.txn_begin().unwrap();
        token
    }

    #[test]
    fn test_select_parses_apt() {
        let mut token = token_in_txn(vec![with_sw(apt_reply(), 0x9000)]);
        token.select().unwrap();
        assert_eq!(token.app_label(), Some("PivApplet"));
        assert_eq!(
            token.algorithms(),
            &[Algorithm::EccP256, Algorithm::EccP384]
        );
    }

    #[test]
    fn test_select_is_idempotent_over_algorithms() {
        let mut token = token_in_txn(vec![with_sw(apt_reply(), 0x9000)]);
        token.select().unwrap();
        token.select().unwrap();
        assert_eq!(token.algorithms().len(), 2);
    }

    #[test]
    fn test_select_rejects_unknown_apt_tag() {
        let mut w = TlvWriter::new();
        w.push(0x61);
        w.push(0x99);
        w.write_byte(0x00);
        w.pop();
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        let err = token.select().unwrap_err();
        assert!(err.caused_by(ErrorKind::Tag));
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_select_not_found() {
        let mut token = token_in_txn(vec![sw_only(0x6A82)]);
        let err = token.select().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_chuid_plain_guid() {
        let guid = [0x42u8; 16];
        let mut token = token_in_txn(vec![with_sw(chuid_reply(guid, &[], None), 0x9000)]);
        token.read_chuid().unwrap();
        assert!(token.has_chuid());
        assert!(!token.has_signed_chuid());
        assert_eq!(token.guid(), Some(&guid));
        assert_eq!(token.expiry(), Some(b"20300101"));
    }

    #[test]
    fn test_chuid_guid_falls_back_to_chuuid() {
        let chuuid = [0x17u8; 16];
        let mut token =
            token_in_txn(vec![with_sw(chuid_reply([0; 16], &[], Some(chuuid)), 0x9000)]);
        token.read_chuid().unwrap();
        assert_eq!(token.guid(), Some(&chuuid));
    }

    #[test]
    fn test_chuid_guid_synthesized_from_fascn() {
        let fascn = [0xD1u8, 0x38, 0x10, 0xD8, 0x28, 0xAC];
        let mut token =
            token_in_txn(vec![with_sw(chuid_reply([0; 16], &fascn, None), 0x9000)]);
        token.read_chuid().unwrap();

        let digest = sha2::Sha256::digest(fascn);
        assert_eq!(token.guid().unwrap().as_slice(), &digest[..16]);
    }

    #[test]
    fn test_chuid_no_identity_means_no_guid() {
        let mut token = token_in_txn(vec![with_sw(chuid_reply([0; 16], &[], None), 0x9000)]);
        token.read_chuid().unwrap();
        assert!(token.has_chuid());
        assert!(token.guid().is_none());
    }

    #[test]
    fn test_discovery_app_pin_policy() {
        let mut token = token_in_txn(vec![with_sw(discov_reply(0x4010), 0x9000)]);
        token.read_discov().unwrap();
        assert!(token.has_auth(PinKind::App));
        assert!(!token.has_auth(PinKind::Global));
        assert_eq!(token.default_auth(), PinKind::App);
    }

    #[test]
    fn test_discovery_global_pin_policy() {
        let mut token = token_in_txn(vec![with_sw(discov_reply(0x2020), 0x9000)]);
        token.read_discov().unwrap();
        assert!(token.has_auth(PinKind::Global));
        assert_eq!(token.default_auth(), PinKind::Global);
    }

    #[test]
    fn test_discovery_occ_and_vci_bits() {
        let mut token = token_in_txn(vec![with_sw(discov_reply(0x1800), 0x9000)]);
        token.read_discov().unwrap();
        assert!(token.has_auth(PinKind::Occ));
        assert!(token.has_vci());
        assert_eq!(token.default_auth(), PinKind::Occ);
    }

    #[test]
    fn test_keyhist_parse() {
        let mut w = TlvWriter::new();
        w.push(0x53);
        w.push(0xC1);
        w.write_byte(3);
        w.pop();
        w.push(0xC2);
        w.write_byte(2);
        w.pop();
        w.push(0xF3);
        w.write(b"https://example.com/certs");
        w.pop();
        w.pop();
        let mut token = token_in_txn(vec![with_sw(w.finish(), 0x9000)]);
        token.read_keyhist().unwrap();
        assert_eq!(token.keyhistory_oncard(), 3);
        assert_eq!(token.keyhistory_offcard(), 2);
        assert_eq!(token.keyhistory_url(), Some("https://example.com/certs"));
    }

    #[test]
    fn test_ykpiv_version_and_serial() {
        let mut token = token_in_txn(vec![
            with_sw(vec![5, 4, 3], 0x9000),
            with_sw(vec![0x00, 0xBC, 0x61, 0x4E], 0x9000),
        ]);
        token.ykpiv_get_version().unwrap();
        assert!(token.is_ykpiv());
        assert_eq!(token.ykpiv_version(), Some([5, 4, 3]));
        assert!(token.ykpiv_version_at_least(5, 0, 0));
        assert!(!token.ykpiv_version_at_least(5, 4, 4));

        token.ykpiv_read_serial().unwrap();
        assert_eq!(token.ykpiv_serial(), Some(12345678));
    }

    #[test]
    fn test_ykpiv_probe_failure_is_silent() {
        let mut token = token_in_txn(vec![sw_only(0x6D00)]);
        let err = token.ykpiv_get_version().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(!token.is_ykpiv());
        assert_eq!(token.ykpiv_version(), None);
    }

    #[test]
    fn test_probe_chuid_only_card() {
        // S1: SELECT ok, CHUID present, everything else absent
        let guid = [9u8; 16];
        let mut token = token_in_txn(vec![
            with_sw(apt_reply(), 0x9000),
            with_sw(chuid_reply(guid, &[], None), 0x9000),
            sw_only(0x6A82), // discovery
            sw_only(0x6A82), // key history
            sw_only(0x6D00), // ykpiv version
        ]);
        token.probe().unwrap();
        assert!(token.has_chuid());
        assert!(!token.is_ykpiv());
        assert_eq!(token.slots().count(), 0);
        assert_eq!(token.default_auth(), PinKind::App);
        assert!(token.has_auth(PinKind::App));
    }

    #[test]
    fn test_txn_end_reset_policy() {
        let mut token = token_in_txn(vec![sw_only(0x9000)]);
        token.must_reset = true;
        token.txn_end();
        assert_eq!(token.transport.last_end_reset, Some(true));
        assert!(!token.must_reset);

        token.txn_begin().unwrap();
        token.txn_end();
        assert_eq!(token.transport.last_end_reset, Some(false));
    }
}
