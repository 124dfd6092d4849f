//! ECDH box: a self-describing envelope sealing data to a PIV slot's key
//!
//! A box seals plaintext to an EC public key with ephemeral-static ECDH:
//! the symmetric key is a digest of the shared secret (and, from format
//! version 2 on, a random nonce), and the payload is PKCS#7-padded and
//! AEAD-encrypted. A box optionally names the GUID and slot of the token
//! holding the recipient key, so [`EcdhBox::find_token`] can locate the
//! right card among those attached.
//!
//! Opening needs either the holding card ([`EcdhBox::open`], which runs the
//! ECDH on-card) or the raw private key ([`EcdhBox::open_offline`]).
//! Offline operations never touch a smartcard.

use pivkit_apdu_core::CardTransport;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::consts::GUID_LEN;
use crate::error::{Error, Result};
use crate::key::{Curve, PrivateKey, PublicKey};
use crate::token::Token;
use crate::types::SlotId;

/// Cipher used when a box doesn't name one
pub const BOX_DEFAULT_CIPHER: &str = "chacha20-poly1305";
/// KDF digest used when a box doesn't name one
pub const BOX_DEFAULT_KDF: &str = "sha512";

const BOX_V1: u8 = 1;
const BOX_V2: u8 = 2;
const BOX_VNEXT: u8 = 4;

const MAGIC: [u8; 2] = [0xB0, 0xC5];

/// Authenticated ciphers usable in a box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxCipher {
    Chacha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl BoxCipher {
    fn by_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305" => Some(Self::Chacha20Poly1305),
            "aes128-gcm" => Some(Self::Aes128Gcm),
            "aes256-gcm" => Some(Self::Aes256Gcm),
            _ => None,
        }
    }

    const fn key_len(self) -> usize {
        match self {
            Self::Chacha20Poly1305 | Self::Aes256Gcm => 32,
            Self::Aes128Gcm => 16,
        }
    }

    const fn iv_len(self) -> usize {
        12
    }

    const fn auth_len(self) -> usize {
        16
    }

    /// Padding granularity. The AEADs are stream ciphers at heart, so this
    /// only hides the exact payload length.
    const fn block_size(self) -> usize {
        match self {
            Self::Chacha20Poly1305 => 8,
            Self::Aes128Gcm | Self::Aes256Gcm => 16,
        }
    }

    fn encrypt(self, key: &[u8], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, KeyInit};
        let out = match self {
            Self::Chacha20Poly1305 => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .expect("key length checked by caller")
                .encrypt(chacha20poly1305::Nonce::from_slice(iv), plain),
            Self::Aes128Gcm => aes_gcm::Aes128Gcm::new_from_slice(key)
                .expect("key length checked by caller")
                .encrypt(aes_gcm::Nonce::from_slice(iv), plain),
            Self::Aes256Gcm => aes_gcm::Aes256Gcm::new_from_slice(key)
                .expect("key length checked by caller")
                .encrypt(aes_gcm::Nonce::from_slice(iv), plain),
        };
        out.map_err(|_| Error::Malformed("box encryption failed".into()))
    }

    fn decrypt(self, key: &[u8], iv: &[u8], enc: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        use chacha20poly1305::aead::{Aead, KeyInit};
        let out = match self {
            Self::Chacha20Poly1305 => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .expect("key length checked by caller")
                .decrypt(chacha20poly1305::Nonce::from_slice(iv), enc),
            Self::Aes128Gcm => aes_gcm::Aes128Gcm::new_from_slice(key)
                .expect("key length checked by caller")
                .decrypt(aes_gcm::Nonce::from_slice(iv), enc),
            Self::Aes256Gcm => aes_gcm::Aes256Gcm::new_from_slice(key)
                .expect("key length checked by caller")
                .decrypt(aes_gcm::Nonce::from_slice(iv), enc),
        };
        out.map(Zeroizing::new)
            .map_err(|_| Error::Malformed("box decryption failed (wrong key or corrupt data)".into()))
    }
}

/// KDF digests usable in a box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxKdf {
    Sha256,
    Sha384,
    Sha512,
}

impl BoxKdf {
    fn by_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Digest of `secret || nonce`. The output is never published (it is
    /// the symmetric key), so plain concatenation is fine here.
    fn derive(self, secret: &[u8], nonce: &[u8]) -> Zeroizing<Vec<u8>> {
        fn run<D: sha2::Digest>(secret: &[u8], nonce: &[u8]) -> Vec<u8> {
            let mut d = D::new();
            d.update(secret);
            if !nonce.is_empty() {
                d.update(nonce);
            }
            d.finalize().to_vec()
        }
        Zeroizing::new(match self {
            Self::Sha256 => run::<sha2::Sha256>(secret, nonce),
            Self::Sha384 => run::<sha2::Sha384>(secret, nonce),
            Self::Sha512 => run::<sha2::Sha512>(secret, nonce),
        })
    }
}

/// A sealed (or opened) ECDH envelope
#[derive(Debug, Default)]
pub struct EcdhBox {
    version: u8,
    guidslot: bool,
    guid: [u8; GUID_LEN],
    slot: u8,
    cipher: Option<String>,
    kdf: Option<String>,
    nonce: Vec<u8>,
    iv: Vec<u8>,
    enc: Vec<u8>,
    recipient: Option<PublicKey>,
    ephem_pub: Option<PublicKey>,
    ephem: Option<PrivateKey>,
    plain: Option<Zeroizing<Vec<u8>>>,
}

impl EcdhBox {
    /// A fresh box at the current format version
    pub fn new() -> Self {
        Self {
            version: BOX_VNEXT - 1,
            ..Default::default()
        }
    }

    /// Format version of this box
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Pin the box to an older format version
    pub fn set_version(&mut self, version: u8) -> Result<()> {
        if !(BOX_V1..BOX_VNEXT).contains(&version) {
            return Err(Error::Version(version));
        }
        self.version = version;
        Ok(())
    }

    /// Whether the box names its holding token and slot
    pub const fn has_guidslot(&self) -> bool {
        self.guidslot
    }

    /// GUID of the token this box was sealed to
    pub fn guid(&self) -> Option<&[u8; GUID_LEN]> {
        self.guidslot.then_some(&self.guid)
    }

    /// Hex form of the sealed-to GUID
    pub fn guid_hex(&self) -> Option<String> {
        self.guid().map(hex::encode)
    }

    /// Raw slot byte this box was sealed to
    pub fn slot(&self) -> Option<u8> {
        self.guidslot.then_some(self.slot)
    }

    /// Name the token GUID this box is held by
    pub fn set_guid(&mut self, guid: [u8; GUID_LEN]) {
        self.guid = guid;
        self.guidslot = true;
    }

    /// Name the slot this box is held by
    pub fn set_slot(&mut self, slot: SlotId) {
        self.slot = slot.to_byte();
        self.guidslot = true;
    }

    /// Cipher name, defaulted when unset
    pub fn cipher_name(&self) -> &str {
        self.cipher.as_deref().unwrap_or(BOX_DEFAULT_CIPHER)
    }

    /// KDF name, defaulted when unset
    pub fn kdf_name(&self) -> &str {
        self.kdf.as_deref().unwrap_or(BOX_DEFAULT_KDF)
    }

    /// Choose the cipher for a future seal
    pub fn set_cipher(&mut self, name: &str) {
        self.cipher = Some(name.to_string());
    }

    /// Choose the KDF digest for a future seal
    pub fn set_kdf(&mut self, name: &str) {
        self.kdf = Some(name.to_string());
    }

    /// Ciphertext length (tag included)
    pub fn encsize(&self) -> usize {
        self.enc.len()
    }

    /// Nonce length (0 on v1 boxes)
    pub fn nonce_len(&self) -> usize {
        self.nonce.len()
    }

    /// The recipient public key
    pub const fn recipient_pubkey(&self) -> Option<&PublicKey> {
        self.recipient.as_ref()
    }

    /// The ephemeral public key
    pub const fn ephem_pubkey(&self) -> Option<&PublicKey> {
        self.ephem_pub.as_ref()
    }

    /// Supply a fixed ephemeral key instead of generating one at seal time
    pub fn set_ephemeral_key(&mut self, key: PrivateKey) {
        self.ephem = Some(key);
    }

    /// Whether the plaintext is currently absent
    pub const fn sealed(&self) -> bool {
        self.plain.is_none()
    }

    /// Stage plaintext for sealing
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        if self.plain.is_some() {
            return Err(Error::argument(
                "box",
                "a box without staged plaintext",
                "already holds data",
            ));
        }
        self.plain = Some(Zeroizing::new(data.to_vec()));
        Ok(())
    }

    /// Take the plaintext out of an opened box, leaving it sealed again.
    /// The internal copy is zeroed.
    pub fn take_data(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.plain.take().ok_or(Error::BoxSealed)
    }

    /// Seal the staged plaintext to `pubkey` without touching a card
    pub fn seal_offline(&mut self, pubkey: &PublicKey) -> Result<()> {
        let curve = pubkey.curve().ok_or_else(|| {
            Error::argument("pubkey", "an ECDSA public key", "an RSA key")
        })?;

        let ephem = match &self.ephem {
            Some(key) => {
                if key.curve() != Some(curve) {
                    return Err(Error::argument(
                        "ephemeral key",
                        "a key on the recipient's curve",
                        "a key on a different curve",
                    ));
                }
                key.clone()
            }
            None => PrivateKey::generate_ec(curve),
        };
        self.ephem_pub = Some(ephem.public_key());

        if self.cipher.is_none() {
            self.cipher = Some(BOX_DEFAULT_CIPHER.to_string());
        }
        if self.kdf.is_none() {
            self.kdf = Some(BOX_DEFAULT_KDF.to_string());
        }
        let cipher = BoxCipher::by_name(self.cipher_name()).ok_or_else(|| {
            Error::BadAlgorithm(format!("cipher '{}' is not supported", self.cipher_name()))
        })?;
        let kdf = BoxKdf::by_name(self.kdf_name()).ok_or_else(|| {
            Error::BadAlgorithm(format!("KDF digest '{}' is not supported", self.kdf_name()))
        })?;
        if kdf.digest_len() < cipher.key_len() {
            return Err(Error::BadAlgorithm(format!(
                "KDF digest '{}' produces output too short for use as key with cipher '{}'",
                self.kdf_name(),
                self.cipher_name()
            )));
        }

        if self.version >= BOX_V2 && self.nonce.is_empty() {
            let mut nonce = vec![0u8; 16];
            OsRng.fill_bytes(&mut nonce);
            self.nonce = nonce;
        }

        let shared = ephem.ecdh(pubkey)?;
        let key = kdf.derive(&shared, &self.nonce);

        let mut iv = vec![0u8; cipher.iv_len()];
        OsRng.fill_bytes(&mut iv);
        self.iv = iv;

        let plain = self.plain.take().ok_or_else(|| {
            Error::argument("box", "a box with staged plaintext", "empty")
        })?;

        // PKCS#7-style padding: up to a full block of bytes, each set to
        // the pad count. Easy to strip and hides the exact length.
        let blocksz = cipher.block_size();
        let padding = blocksz - (plain.len() % blocksz);
        let mut padded = Zeroizing::new(Vec::with_capacity(plain.len() + padding));
        padded.extend_from_slice(&plain);
        padded.resize(plain.len() + padding, padding as u8);

        self.enc = cipher.encrypt(&key[..cipher.key_len()], &self.iv, &padded)?;
        self.recipient = Some(pubkey.clone());

        Ok(())
    }

    /// Seal the staged plaintext to a slot on a token, recording the
    /// token's GUID and the slot for later discovery
    pub fn seal<T: CardTransport>(&mut self, token: &Token<T>, slot_id: SlotId) -> Result<()> {
        let pubkey = token
            .slot(slot_id)
            .and_then(|s| s.public_key().cloned())
            .ok_or_else(|| {
                Error::argument("slot", "a slot with a known public key", format!("{slot_id}"))
            })?;

        self.seal_offline(&pubkey)?;

        self.guid = token.guid;
        self.slot = slot_id.to_byte();
        self.guidslot = true;
        Ok(())
    }

    /// Open the box with the raw private key, without touching a card
    pub fn open_offline(&mut self, key: &PrivateKey) -> Result<()> {
        let ephem = self.ephem_pub.clone().ok_or_else(|| {
            Error::argument("box", "a sealed box with an ephemeral key", "missing")
        })?;
        let secret = key.ecdh(&ephem)?;
        self.open_with_secret(&secret)
    }

    /// Open the box with the holding card: the ECDH runs on-card in
    /// `slot_id`, everything after that on the host
    pub fn open<T: CardTransport>(&mut self, token: &mut Token<T>, slot_id: SlotId) -> Result<()> {
        let ephem = self.ephem_pub.clone().ok_or_else(|| {
            Error::argument("box", "a sealed box with an ephemeral key", "missing")
        })?;
        let secret = token.ecdh(slot_id, &ephem)?;
        self.open_with_secret(&secret)
    }

    fn open_with_secret(&mut self, secret: &[u8]) -> Result<()> {
        let cipher = BoxCipher::by_name(self.cipher_name()).ok_or_else(|| {
            Error::BadAlgorithm(format!("cipher '{}' is not supported", self.cipher_name()))
        })?;
        let kdf = BoxKdf::by_name(self.kdf_name()).ok_or_else(|| {
            Error::BadAlgorithm(format!("KDF digest '{}' is not supported", self.kdf_name()))
        })?;
        if kdf.digest_len() < cipher.key_len() {
            return Err(Error::BadAlgorithm(format!(
                "KDF digest '{}' produces output too short for use as key with cipher '{}'",
                self.kdf_name(),
                self.cipher_name()
            )));
        }

        let key = kdf.derive(secret, &self.nonce);

        if self.iv.len() != cipher.iv_len() {
            return Err(Error::Length(format!(
                "IV length ({}) is not appropriate for cipher '{}'",
                self.iv.len(),
                self.cipher_name()
            )));
        }
        if self.enc.len() < cipher.auth_len() + cipher.block_size() {
            return Err(Error::Length(format!(
                "ciphertext length ({}) is smaller than minimum length (auth tag + 1 block = {})",
                self.enc.len(),
                cipher.auth_len() + cipher.block_size()
            )));
        }

        let mut plain = cipher.decrypt(&key[..cipher.key_len()], &self.iv, &self.enc)?;

        // Strip the padding, checking every pad byte.
        let padding = *plain.last().expect("minimum length checked above") as usize;
        if padding < 1 || padding > cipher.block_size() {
            return Err(Error::Padding);
        }
        let reallen = plain.len() - padding;
        if plain[reallen..].iter().any(|b| *b as usize != padding) {
            return Err(Error::Padding);
        }
        plain.truncate(reallen);

        self.plain = Some(plain);
        Ok(())
    }

    /// Locate the token and slot holding this box's recipient key.
    ///
    /// Policy: exact GUID match first (reading just the named slot if the
    /// catalog misses it), then a probe of the named slot (or 9D) across
    /// all tokens, then a full catalog scan of tokens not yet scanned.
    /// First match in token order wins. Returns the index into `tokens`
    /// plus the slot.
    pub fn find_token<T: CardTransport>(
        &self,
        tokens: &mut [Token<T>],
    ) -> Result<(usize, SlotId)> {
        let recipient = self.recipient.as_ref().ok_or_else(|| {
            Error::argument("box", "a box with a recipient public key", "missing")
        })?;

        if self.guidslot {
            // Exact match on the GUID.
            for i in 0..tokens.len() {
                if tokens[i].guid != self.guid {
                    continue;
                }
                let slot_id = SlotId::from_byte(self.slot)?;
                if tokens[i].slot(slot_id).is_none() {
                    let token = &mut tokens[i];
                    token.txn_begin()?;
                    let read = token.select().and_then(|_| token.read_cert(slot_id));
                    token.txn_end();
                    read?;
                }
                let found = match tokens[i].slot(slot_id).and_then(|s| s.public_key()) {
                    Some(key) => key,
                    None => continue,
                };
                if found != recipient {
                    return Err(Error::not_found(
                        "PIV token on system with matching GUID for box has different key",
                        None,
                    ));
                }
                return Ok((i, slot_id));
            }

            // No GUID matched: probe the named slot (or key-management) on
            // every token.
            let slot_id = match self.slot {
                0x00 | 0xFF => SlotId::KeyManagement,
                byte => SlotId::from_byte(byte).unwrap_or(SlotId::KeyManagement),
            };
            for i in 0..tokens.len() {
                if tokens[i].slot(slot_id).is_none() {
                    let token = &mut tokens[i];
                    if token.txn_begin().is_err() {
                        continue;
                    }
                    let read = token.select().and_then(|_| token.read_cert(slot_id));
                    token.txn_end();
                    if read.is_err() {
                        continue;
                    }
                }
                if tokens[i].slot(slot_id).and_then(|s| s.public_key()) == Some(recipient) {
                    return Ok((i, slot_id));
                }
            }
        }

        // Exhaustively check every slot on every token.
        for i in 0..tokens.len() {
            if !tokens[i].did_read_all {
                let token = &mut tokens[i];
                if token.txn_begin().is_err() {
                    continue;
                }
                let read = token.select().and_then(|_| token.read_all_certs());
                token.txn_end();
                if read.is_err() {
                    continue;
                }
            }
            for slot in tokens[i].slots() {
                if slot.public_key() == Some(recipient) {
                    return Ok((i, slot.id()));
                }
            }
        }

        Err(Error::not_found("no PIV token found on system to unlock box", None))
    }

    /// Serialize the box to its binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let recipient = self.recipient.as_ref().ok_or_else(|| {
            Error::argument("box", "a sealed box with a recipient key", "missing")
        })?;
        let ephem = self.ephem_pub.as_ref().ok_or_else(|| {
            Error::argument("box", "a sealed box with an ephemeral key", "missing")
        })?;
        let curve = match (recipient.curve(), ephem.curve()) {
            (Some(a), Some(b)) if a == b => a,
            (Some(_), Some(_)) => {
                return Err(Error::argument(
                    "box",
                    "recipient and ephemeral keys on the same EC curve",
                    "keys on different curves",
                ));
            }
            _ => {
                return Err(Error::argument(
                    "box",
                    "ECDSA recipient and ephemeral keys",
                    "an RSA key",
                ));
            }
        };
        if self.version < BOX_V2 && !self.nonce.is_empty() {
            return Err(Error::argument(
                "box",
                "no nonce on a version 1 box",
                format!("{} nonce bytes", self.nonce.len()),
            ));
        }

        let mut w = BufWriter::new();
        w.put_u8(MAGIC[0]);
        w.put_u8(MAGIC[1]);
        w.put_u8(self.version);

        if self.guidslot {
            w.put_u8(0x01);
            w.put_string8(&self.guid)?;
            w.put_u8(self.slot);
        } else {
            w.put_u8(0x00);
            w.put_u8(0x00);
            w.put_u8(0x00);
        }

        w.put_cstring8(self.cipher_name())?;
        w.put_cstring8(self.kdf_name())?;

        if self.version >= BOX_V2 {
            w.put_string8(&self.nonce)?;
        }

        w.put_cstring8(curve.name())?;
        w.put_string8(&recipient.ec_point()?)?;
        w.put_string8(&ephem.ec_point()?)?;
        w.put_string8(&self.iv)?;
        w.put_string32(&self.enc);

        Ok(w.finish())
    }

    /// Deserialize a box, accepting both the magic-prefixed format and the
    /// legacy v1 layout (identified by a leading 0x01 byte)
    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        if input.len() > 1 && input[0] == 0x01 {
            return Self::from_bytes_old_v1(input);
        }

        let mut r = BufReader::new(input);
        let magic = [r.get_u8()?, r.get_u8()?];
        if magic != MAGIC {
            return Err(Error::Magic(magic[0], magic[1]));
        }

        let version = r.get_u8()?;
        if !(BOX_V1..BOX_VNEXT).contains(&version) {
            return Err(Error::Version(version));
        }

        let mut bx = Self::new();
        bx.version = version;

        bx.guidslot = r.get_u8()? != 0x00;
        let guid = r.get_string8()?;
        if bx.guidslot {
            if guid.len() != GUID_LEN {
                return Err(Error::Length(format!(
                    "box is marked guidslot_valid but GUID length is only {}",
                    guid.len()
                )));
            }
            bx.guid.copy_from_slice(guid);
        }
        let slot = r.get_u8()?;
        if bx.guidslot {
            bx.slot = slot;
        }

        bx.cipher = Some(r.get_cstring8()?);
        bx.kdf = Some(r.get_cstring8()?);

        if version >= BOX_V2 {
            bx.nonce = r.get_string8()?.to_vec();
        }

        let curve = Curve::from_name(&r.get_cstring8()?)?;
        bx.recipient = Some(PublicKey::from_sec1(curve, r.get_string8()?)?);
        bx.ephem_pub = Some(PublicKey::from_sec1(curve, r.get_string8()?)?);

        bx.iv = r.get_string8()?.to_vec();
        bx.enc = r.get_string32()?.to_vec();

        Ok(bx)
    }

    /// The original v1 layout: no magic, SSH-blob keys, 32-bit lengths
    fn from_bytes_old_v1(input: &[u8]) -> Result<Self> {
        let mut r = BufReader::new(input);

        let version = r.get_u8()?;
        if version != BOX_V1 {
            return Err(Error::Version(version));
        }

        let mut bx = Self::new();
        bx.version = BOX_V1;
        bx.guidslot = true;

        let guid = r.get_string32()?;
        if guid.len() != GUID_LEN {
            return Err(Error::Length(format!(
                "legacy box GUID length is {} (want {GUID_LEN})",
                guid.len()
            )));
        }
        bx.guid.copy_from_slice(guid);
        bx.slot = r.get_u8()?;

        bx.ephem_pub = Some(parse_ssh_pubkey_blob(r.get_string32()?)?);
        bx.recipient = Some(parse_ssh_pubkey_blob(r.get_string32()?)?);

        bx.cipher = Some(r.get_cstring32()?);
        bx.kdf = Some(r.get_cstring32()?);
        bx.iv = r.get_string32()?.to_vec();
        bx.enc = r.get_string32()?.to_vec();

        Ok(bx)
    }
}

/// Parse an SSH public key blob: string key type, string curve name,
/// string point
fn parse_ssh_pubkey_blob(blob: &[u8]) -> Result<PublicKey> {
    let mut r = BufReader::new(blob);
    let ktype = String::from_utf8(r.get_string32()?.to_vec())
        .map_err(|_| Error::Malformed("SSH key type is not valid UTF-8".into()))?;
    let curve_name = String::from_utf8(r.get_string32()?.to_vec())
        .map_err(|_| Error::Malformed("SSH curve name is not valid UTF-8".into()))?;
    let point = r.get_string32()?;

    let curve = Curve::from_name(&curve_name)?;
    if ktype != format!("ecdsa-sha2-{}", curve.name()) {
        return Err(Error::Malformed(format!(
            "unexpected SSH key type '{ktype}' in legacy box"
        )));
    }
    PublicKey::from_sec1(curve, point)
}

struct BufReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Malformed("box buffer is truncated".into()));
        }
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_string8(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u8()? as usize;
        self.take(len)
    }

    fn get_string32(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")) as usize;
        self.take(len)
    }

    fn get_cstring8(&mut self) -> Result<String> {
        let v = self.get_string8()?;
        String::from_utf8(v.to_vec())
            .map_err(|_| Error::Malformed("box string is not valid UTF-8".into()))
    }

    fn get_cstring32(&mut self) -> Result<String> {
        let v = self.get_string32()?;
        String::from_utf8(v.to_vec())
            .map_err(|_| Error::Malformed("box string is not valid UTF-8".into()))
    }
}

struct BufWriter {
    buf: Vec<u8>,
}

impl BufWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_string8(&mut self, v: &[u8]) -> Result<()> {
        if v.len() > 0xFF {
            return Err(Error::Length(format!(
                "{} bytes does not fit an 8-bit length prefix",
                v.len()
            )));
        }
        self.buf.push(v.len() as u8);
        self.buf.extend_from_slice(v);
        Ok(())
    }

    fn put_cstring8(&mut self, v: &str) -> Result<()> {
        self.put_string8(v.as_bytes())
    }

    fn put_string32(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sealed_box(data: &[u8]) -> (EcdhBox, PrivateKey) {
        let key = PrivateKey::generate_ec(Curve::P256);
        let mut bx = EcdhBox::new();
        bx.set_data(data).unwrap();
        bx.seal_offline(&key.public_key()).unwrap();
        (bx, key)
    }

    #[test]
    fn test_default_names() {
        let bx = EcdhBox::new();
        assert_eq!(bx.version(), 3);
        assert_eq!(bx.cipher_name(), "chacha20-poly1305");
        assert_eq!(bx.kdf_name(), "sha512");
        assert!(bx.sealed());
        assert!(!bx.has_guidslot());
    }

    #[test]
    fn test_seal_length_arithmetic() {
        // "hello" is 5 bytes; chacha20-poly1305 pads to 8 and appends a
        // 16-byte tag
        let (bx, _) = sealed_box(b"hello");
        assert_eq!(bx.encsize(), 8 + 16);
        assert_eq!(bx.nonce_len(), 16);
        assert!(bx.sealed());
    }

    #[test]
    fn test_take_data_on_sealed_box() {
        let (mut bx, _) = sealed_box(b"hello");
        assert!(matches!(bx.take_data(), Err(Error::BoxSealed)));
    }

    #[test]
    fn test_v1_box_has_no_nonce() {
        let key = PrivateKey::generate_ec(Curve::P256);
        let mut bx = EcdhBox::new();
        bx.set_version(1).unwrap();
        bx.set_data(b"legacy").unwrap();
        bx.seal_offline(&key.public_key()).unwrap();
        assert_eq!(bx.nonce_len(), 0);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let err = EcdhBox::from_bytes(&[0xB1, 0xC5, 0x02, 0x00]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Magic);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let (bx, _) = sealed_box(b"versioned");
        let mut bytes = bx.to_bytes().unwrap();
        bytes[2] = BOX_VNEXT;
        let err = EcdhBox::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Version);

        bytes[2] = 0;
        let err = EcdhBox::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Version);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let (bx, _) = sealed_box(b"short read");
        let bytes = bx.to_bytes().unwrap();
        let err = EcdhBox::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_legacy_v1_short_guid_is_length_error() {
        let mut w = BufWriter::new();
        w.put_u8(0x01);
        w.put_string32(&[0xAB; 15]);
        let err = EcdhBox::from_bytes(&w.finish()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Length);
    }

    #[test]
    fn test_legacy_v1_decode() {
        // assemble a v1 box by hand, then open it offline
        let recipient = PrivateKey::generate_ec(Curve::P256);
        let mut bx = EcdhBox::new();
        bx.set_version(1).unwrap();
        bx.set_data(b"old wine").unwrap();
        bx.seal_offline(&recipient.public_key()).unwrap();

        let blob = |key: &PublicKey| -> Vec<u8> {
            let mut w = BufWriter::new();
            w.put_string32(b"ecdsa-sha2-nistp256");
            w.put_string32(b"nistp256");
            w.put_string32(&key.ec_point().unwrap());
            w.finish()
        };

        let mut w = BufWriter::new();
        w.put_u8(0x01);
        w.put_string32(&[0x5A; 16]);
        w.put_u8(0x9D);
        w.put_string32(&blob(bx.ephem_pubkey().unwrap()));
        w.put_string32(&blob(bx.recipient_pubkey().unwrap()));
        w.put_string32(bx.cipher_name().as_bytes());
        w.put_string32(bx.kdf_name().as_bytes());
        w.put_string32(&bx.iv);
        w.put_string32(&bx.enc);

        let mut decoded = EcdhBox::from_bytes(&w.finish()).unwrap();
        assert_eq!(decoded.version(), 1);
        assert_eq!(decoded.slot(), Some(0x9D));
        assert_eq!(decoded.guid(), Some(&[0x5A; 16]));

        decoded.open_offline(&recipient).unwrap();
        assert_eq!(decoded.take_data().unwrap().as_slice(), b"old wine");
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let (mut bx, key) = sealed_box(b"integrity");
        let last = bx.enc.len() - 1;
        bx.enc[last] ^= 0x01;
        let err = bx.open_offline(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_open_rejects_short_ciphertext() {
        let (mut bx, key) = sealed_box(b"too short");
        bx.enc.truncate(10);
        let err = bx.open_offline(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Length);
    }

    #[test]
    fn test_open_rejects_wrong_iv_len() {
        let (mut bx, key) = sealed_box(b"iv check");
        bx.iv.pop();
        let err = bx.open_offline(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Length);
    }

    #[test]
    fn test_unknown_cipher_is_bad_algorithm() {
        let (mut bx, key) = sealed_box(b"alg check");
        bx.set_cipher("rot13");
        let err = bx.open_offline(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadAlgorithm);
    }

    mod online {
        use super::*;
        use crate::consts::AID_PIV;
        use crate::tlv::TlvWriter;
        use bytes::Bytes;
        use p256::pkcs8::EncodePrivateKey;
        use pivkit_apdu_core::transport::MockTransport;

        fn with_sw(mut body: Vec<u8>, sw: u16) -> Bytes {
            body.extend_from_slice(&sw.to_be_bytes());
            Bytes::from(body)
        }

        fn apt_reply() -> Bytes {
            let mut w = TlvWriter::new();
            w.push(0x61);
            w.push(0x4F);
            w.write(&AID_PIV[..9]);
            w.pop();
            w.pop();
            with_sw(w.finish(), 0x9000)
        }

        fn cert_reply(sk: &p256::SecretKey) -> Bytes {
            let pkcs8 = sk.to_pkcs8_der().unwrap();
            let keypair = rcgen::KeyPair::try_from(pkcs8.as_bytes()).unwrap();
            let cert = rcgen::CertificateParams::new(vec!["box-test".to_string()])
                .unwrap()
                .self_signed(&keypair)
                .unwrap();

            let mut w = TlvWriter::new();
            w.push(0x53);
            w.push(0x70);
            w.write(cert.der());
            w.pop();
            w.push(0x71);
            w.write_byte(0x00);
            w.pop();
            w.pop();
            let out = with_sw(w.finish(), 0x9000);
            eprintln!("CERT_REPLY_LEN={}", out.len());
            out
        }

        /// A token whose key-management slot holds `sk`'s certificate
        fn token_with_key(sk: &p256::SecretKey) -> Token<MockTransport> {
            let mut token = Token::new(MockTransport::new(vec![apt_reply(), cert_reply(sk)]));
            token.txn_begin().unwrap();
            token.select().unwrap();
            token.read_cert(SlotId::KeyManagement).unwrap();
            token.txn_end();
            token
        }

        #[test]
        fn test_seal_find_and_open_with_card() {
            let sk = p256::SecretKey::random(&mut OsRng);
            let mut token = token_with_key(&sk);

            let mut bx = EcdhBox::new();
            bx.set_data(b"sealed to the card").unwrap();
            bx.seal(&token, SlotId::KeyManagement).unwrap();
            assert!(bx.has_guidslot());
            assert_eq!(bx.slot(), Some(0x9D));

            let mut tokens = vec![token];
            let (idx, slot_id) = bx.find_token(&mut tokens).unwrap();
            assert_eq!(idx, 0);
            assert_eq!(slot_id, SlotId::KeyManagement);

            // The card's half of the exchange: ECDH against the ephemeral
            // public key, returned in the GEN AUTH response template.
            let secret = PrivateKey::P256(sk)
                .ecdh(bx.ephem_pubkey().unwrap())
                .unwrap();
            let mut w = TlvWriter::new();
            w.push(0x7C);
            w.push(0x82);
            w.write(&secret);
            w.pop();
            w.pop();

            let token = &mut tokens[idx];
            token.transport.responses = vec![with_sw(w.finish(), 0x9000)];
            token.txn_begin().unwrap();
            bx.open(token, slot_id).unwrap();
            token.txn_end();

            assert_eq!(bx.take_data().unwrap().as_slice(), b"sealed to the card");
        }

        #[test]
        fn test_find_token_rejects_guid_match_with_other_key() {
            let sk = p256::SecretKey::random(&mut OsRng);
            let token = token_with_key(&sk);

            // sealed to a different key, but claiming this token's GUID
            let other = PrivateKey::generate_ec(Curve::P256);
            let mut bx = EcdhBox::new();
            bx.set_data(b"wrong card").unwrap();
            bx.seal_offline(&other.public_key()).unwrap();
            bx.set_guid(token.guid);
            bx.set_slot(SlotId::KeyManagement);

            let mut tokens = vec![token];
            let err = bx.find_token(&mut tokens).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }

        #[test]
        fn test_find_token_none_matches() {
            let sk = p256::SecretKey::random(&mut OsRng);
            let token = token_with_key(&sk);

            let other = PrivateKey::generate_ec(Curve::P256);
            let mut bx = EcdhBox::new();
            bx.set_data(b"nobody home").unwrap();
            bx.seal_offline(&other.public_key()).unwrap();

            let mut tokens = vec![token];
            // the exhaustive scan re-reads the catalog; feed it failures
            tokens[0].transport.responses =
                vec![apt_reply(), Bytes::from_static(&[0x6A, 0x82])];
            let err = bx.find_token(&mut tokens).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }
}
