//! Public and private key values used by slots and the ECDH box
//!
//! PIV keys live on the NIST P-256 and P-384 curves or are RSA; the enums
//! here tag the concrete curve so callers never mix points from different
//! groups.

use elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use spki::SubjectPublicKeyInfoOwned;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::types::Algorithm;

const OID_RSA_ENCRYPTION: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP256R1: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: der::asn1::ObjectIdentifier =
    der::asn1::ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// An elliptic curve supported by PIV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    /// NIST P-256 (secp256r1)
    P256,
    /// NIST P-384 (secp384r1)
    P384,
}

impl Curve {
    /// The curve name used in box envelopes (SSH-style)
    pub const fn name(self) -> &'static str {
        match self {
            Self::P256 => "nistp256",
            Self::P384 => "nistp384",
        }
    }

    /// Look up a curve by its envelope name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "nistp256" => Ok(Self::P256),
            "nistp384" => Ok(Self::P384),
            other => Err(Error::Curve(other.to_string())),
        }
    }

    /// Size of a field element in bytes
    pub const fn field_bytes(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }
}

/// A public key extracted from a certificate, generated on-card, or decoded
/// from a box envelope
#[derive(Debug, Clone, PartialEq)]
pub enum PublicKey {
    /// EC key on P-256
    P256(p256::PublicKey),
    /// EC key on P-384
    P384(p384::PublicKey),
    /// RSA key
    Rsa(rsa::RsaPublicKey),
}

impl PublicKey {
    /// The PIV algorithm this key corresponds to
    pub fn algorithm(&self) -> Result<Algorithm> {
        match self {
            Self::P256(_) => Ok(Algorithm::EccP256),
            Self::P384(_) => Ok(Algorithm::EccP384),
            Self::Rsa(k) => match k.n().bits() {
                1024 => Ok(Algorithm::Rsa1024),
                2048 => Ok(Algorithm::Rsa2048),
                bits => Err(Error::BadAlgorithm(format!(
                    "subject is RSA key of size {bits}, not supported by PIV"
                ))),
            },
        }
    }

    /// The curve of an EC key
    pub fn curve(&self) -> Option<Curve> {
        match self {
            Self::P256(_) => Some(Curve::P256),
            Self::P384(_) => Some(Curve::P384),
            Self::Rsa(_) => None,
        }
    }

    /// Parse a key out of an X.509 SubjectPublicKeyInfo
    pub(crate) fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        let body = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| Error::Malformed("subject public key has unused bits".into()))?;

        if spki.algorithm.oid == OID_RSA_ENCRYPTION {
            let key = rsa::RsaPublicKey::from_pkcs1_der(body)
                .map_err(|e| Error::Malformed(format!("bad RSA subject public key: {e}")))?;
            Ok(Self::Rsa(key))
        } else if spki.algorithm.oid == OID_EC_PUBLIC_KEY {
            let params = spki
                .algorithm
                .parameters
                .as_ref()
                .ok_or_else(|| Error::Malformed("EC subject public key has no parameters".into()))?;
            let curve_oid: der::asn1::ObjectIdentifier = params
                .decode_as()
                .map_err(|_| Error::Malformed("EC parameters are not a named curve".into()))?;
            let curve = if curve_oid == OID_SECP256R1 {
                Curve::P256
            } else if curve_oid == OID_SECP384R1 {
                Curve::P384
            } else {
                return Err(Error::Curve(curve_oid.to_string()));
            };
            Self::from_sec1(curve, body)
        } else {
            Err(Error::BadAlgorithm(format!(
                "certificate subject key is of unsupported type: {}",
                spki.algorithm.oid
            )))
        }
    }

    /// Parse an EC public key from SEC1 point bytes, validating it lies on
    /// the named curve
    pub(crate) fn from_sec1(curve: Curve, point: &[u8]) -> Result<Self> {
        match curve {
            Curve::P256 => p256::PublicKey::from_sec1_bytes(point)
                .map(Self::P256)
                .map_err(|_| Error::Malformed("invalid P-256 public key point".into())),
            Curve::P384 => p384::PublicKey::from_sec1_bytes(point)
                .map(Self::P384)
                .map_err(|_| Error::Malformed("invalid P-384 public key point".into())),
        }
    }

    /// Uncompressed SEC1 encoding of an EC key
    pub(crate) fn ec_point(&self) -> Result<Vec<u8>> {
        match self {
            Self::P256(k) => Ok(k.to_encoded_point(false).as_bytes().to_vec()),
            Self::P384(k) => Ok(k.to_encoded_point(false).as_bytes().to_vec()),
            Self::Rsa(_) => Err(Error::argument(
                "pubkey",
                "an ECDSA public key",
                "an RSA key",
            )),
        }
    }
}

/// A private key held in host memory, for offline box operations and key
/// import
#[derive(Clone)]
pub enum PrivateKey {
    /// EC key on P-256
    P256(p256::SecretKey),
    /// EC key on P-384
    P384(p384::SecretKey),
    /// RSA key
    Rsa(rsa::RsaPrivateKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::P256(_) => "P256",
            Self::P384(_) => "P384",
            Self::Rsa(_) => "Rsa",
        };
        f.debug_tuple("PrivateKey").field(&kind).finish()
    }
}

impl PrivateKey {
    /// Generate a fresh EC key on `curve`
    pub fn generate_ec(curve: Curve) -> Self {
        match curve {
            Curve::P256 => Self::P256(p256::SecretKey::random(&mut OsRng)),
            Curve::P384 => Self::P384(p384::SecretKey::random(&mut OsRng)),
        }
    }

    /// The public half of this key
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::P256(k) => PublicKey::P256(k.public_key()),
            Self::P384(k) => PublicKey::P384(k.public_key()),
            Self::Rsa(k) => PublicKey::Rsa(rsa::RsaPublicKey::from(k)),
        }
    }

    /// The curve of an EC key
    pub fn curve(&self) -> Option<Curve> {
        match self {
            Self::P256(_) => Some(Curve::P256),
            Self::P384(_) => Some(Curve::P384),
            Self::Rsa(_) => None,
        }
    }

    /// ECDH between this key and a peer public key on the same curve.
    ///
    /// Returns the x coordinate of the shared point, field-size bytes.
    pub(crate) fn ecdh(&self, peer: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        match (self, peer) {
            (Self::P256(sk), PublicKey::P256(pk)) => {
                let shared = p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            (Self::P384(sk), PublicKey::P384(pk)) => {
                let shared = p384::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            (Self::Rsa(_), _) | (_, PublicKey::Rsa(_)) => Err(Error::argument(
                "key",
                "an ECDSA key",
                "an RSA key",
            )),
            _ => Err(Error::argument(
                "pubkey",
                "a public key on the same EC curve",
                "a key on a different curve",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_names() {
        assert_eq!(Curve::P256.name(), "nistp256");
        assert_eq!(Curve::from_name("nistp384").unwrap(), Curve::P384);
        assert!(matches!(Curve::from_name("nistp521"), Err(Error::Curve(_))));
    }

    #[test]
    fn test_ecdh_agrees() {
        let a = PrivateKey::generate_ec(Curve::P256);
        let b = PrivateKey::generate_ec(Curve::P256);
        let s1 = a.ecdh(&b.public_key()).unwrap();
        let s2 = b.ecdh(&a.public_key()).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), 32);
    }

    #[test]
    fn test_ecdh_rejects_curve_mismatch() {
        let a = PrivateKey::generate_ec(Curve::P256);
        let b = PrivateKey::generate_ec(Curve::P384);
        assert!(a.ecdh(&b.public_key()).is_err());
    }

    #[test]
    fn test_ec_point_roundtrip() {
        let key = PrivateKey::generate_ec(Curve::P384);
        let point = key.public_key().ec_point().unwrap();
        assert_eq!(point.len(), 97);
        assert_eq!(point[0], 0x04);
        let back = PublicKey::from_sec1(Curve::P384, &point).unwrap();
        assert_eq!(back, key.public_key());
    }
}
