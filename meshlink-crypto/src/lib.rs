//! Meshlink cryptographic primitives.
//!
//! Stations are identified by a static x25519 key pair. The same pair is used
//! for both directions of the sealed-box scheme in [`seal`]: contact
//! information published to the rendezvous service is sealed symmetrically
//! under a pre-shared discovery secret, while relayed payloads are sealed to
//! the recipient station's public key.
pub mod seal;

use std::{fmt, str::FromStr};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rand_core::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

/// PEM armor label for public keys.
const PUBLIC_KEY_LABEL: &str = "MESHLINK PUBLIC KEY";
/// PEM armor label for secret keys.
const SECRET_KEY_LABEL: &str = "MESHLINK PRIVATE KEY";

#[derive(Error, Debug)]
pub enum KeyError {
    /// The armor headers or base64 body couldn't be parsed.
    #[error("invalid PEM armor for `{0}`")]
    Armor(&'static str),
    /// The decoded key material has the wrong length.
    #[error("invalid key length {0}, expected 32 bytes")]
    Length(usize),
    /// The base64 body couldn't be decoded.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// An x25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Encode with PEM armor, as stored in the station configuration.
    pub fn to_pem(&self) -> String {
        pem::encode(PUBLIC_KEY_LABEL, self.as_bytes())
    }

    pub fn from_pem(s: &str) -> Result<Self, KeyError> {
        let bytes = pem::decode(PUBLIC_KEY_LABEL, s)?;
        Ok(Self::from(bytes))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }
}

impl From<&SecretKey> for PublicKey {
    fn from(sk: &SecretKey) -> Self {
        Self(x25519_dalek::PublicKey::from(&sk.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_STANDARD.decode(s)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| KeyError::Length(v.len()))?;

        Ok(Self::from(bytes))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// An x25519 secret key. Zeroed on drop.
#[derive(Clone)]
pub struct SecretKey(x25519_dalek::StaticSecret);

impl SecretKey {
    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self)
    }

    pub fn to_pem(&self) -> String {
        let mut bytes = self.0.to_bytes();
        let pem = pem::encode(SECRET_KEY_LABEL, &bytes);
        bytes.zeroize();

        pem
    }

    pub fn from_pem(s: &str) -> Result<Self, KeyError> {
        let mut bytes = pem::decode(SECRET_KEY_LABEL, s)?;
        let sk = Self(x25519_dalek::StaticSecret::from(bytes));
        bytes.zeroize();

        Ok(sk)
    }
}

impl From<[u8; 32]> for SecretKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A static station key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS entropy source.
    pub fn generate() -> Self {
        let secret = SecretKey(x25519_dalek::StaticSecret::random_from_rng(OsRng));
        let public = secret.public_key();

        Self { public, secret }
    }

    #[cfg(any(test, feature = "test"))]
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut bytes = [0u8; 32];
        for b in bytes.iter_mut() {
            *b = rng.u8(..);
        }
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();

        Self { public, secret }
    }
}

/// Minimal PEM armor for raw 32-byte keys.
mod pem {
    use super::*;

    pub(super) fn encode(label: &str, bytes: &[u8]) -> String {
        format!(
            "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
            BASE64_STANDARD.encode(bytes)
        )
    }

    pub(super) fn decode(label: &'static str, s: &str) -> Result<[u8; 32], KeyError> {
        let begin = format!("-----BEGIN {label}-----");
        let end = format!("-----END {label}-----");
        let mut body = String::new();
        let mut inside = false;

        for line in s.lines().map(str::trim) {
            if line == begin {
                inside = true;
            } else if line == end {
                let bytes = BASE64_STANDARD.decode(&body)?;
                return bytes
                    .try_into()
                    .map_err(|v: Vec<u8>| KeyError::Length(v.len()));
            } else if inside {
                body.push_str(line);
            }
        }
        Err(KeyError::Armor(label))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_public_key_pem_roundtrip() {
        let kp = KeyPair::from_seed(7);
        let pem = kp.public.to_pem();

        assert!(pem.starts_with("-----BEGIN MESHLINK PUBLIC KEY-----"));
        assert_eq!(PublicKey::from_pem(&pem).unwrap(), kp.public);
    }

    #[test]
    fn test_secret_key_pem_roundtrip() {
        let kp = KeyPair::from_seed(7);
        let pem = kp.secret.to_pem();
        let sk = SecretKey::from_pem(&pem).unwrap();

        assert_eq!(sk.public_key(), kp.public);
    }

    #[test]
    fn test_pem_rejects_wrong_label() {
        let kp = KeyPair::from_seed(7);
        assert!(SecretKey::from_pem(&kp.public.to_pem()).is_err());
    }

    #[test]
    fn test_public_key_string_roundtrip() {
        let kp = KeyPair::from_seed(42);
        let s = kp.public.to_string();

        assert_eq!(s.parse::<PublicKey>().unwrap(), kp.public);
    }

    #[test]
    fn test_keypair_matches() {
        let kp = KeyPair::generate();
        assert_eq!(kp.secret.public_key(), kp.public);
    }
}
