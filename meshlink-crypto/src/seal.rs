//! Sealed-box encryption for discovery and relay payloads, and the
//! possession proofs used by the session handshake.
//!
//! Three schemes:
//!
//! * *Contact seals*: symmetric ChaCha20-Poly1305. The key is derived from
//!   the pre-shared discovery secret, so any station holding the secret can
//!   open another station's contact information, and nobody else can.
//! * *Message seals*: hybrid. An ephemeral x25519 key agrees with the
//!   recipient's static public key; only the holder of the matching secret
//!   key can open the box.
//! * *Possession proofs* ([`prove`]/[`verify`]): a tag over a challenge
//!   nonce, keyed by the *static* x25519 agreement between the prover's
//!   secret key and the verifier's public key. The agreement is symmetric,
//!   so the verifier recomputes the tag from its own secret and the
//!   prover's public key; producing it without one of the two secret keys
//!   would require breaking the curve.
//!
//! Any tampering with a sealed payload fails authentication and surfaces as
//! [`Error::Decrypt`].
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

use crate::{PublicKey, SecretKey};

/// AEAD nonce size in bytes.
const NONCE_SIZE: usize = 12;
/// Derivation context for contact seals.
const CONTACT_CONTEXT: &[u8] = b"meshlink/contact/v1";
/// Derivation context for message seals.
const MESSAGE_CONTEXT: &[u8] = b"meshlink/seal/v1";
/// Derivation context for possession proofs.
const AUTH_CONTEXT: &[u8] = b"meshlink/auth/v1";
/// Possession proof size in bytes.
pub const PROOF_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum Error {
    /// Authentication failed: the payload was forged, corrupted, or sealed
    /// for a different key.
    #[error("decryption failed")]
    Decrypt,
    /// The payload is too short to contain the expected header.
    #[error("sealed payload is truncated ({0} bytes)")]
    Truncated(usize),
    /// The base64 transport encoding is invalid.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decrypted contact info is not valid JSON.
    #[error("invalid contact info: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contact information published to the discovery service, in sealed form.
///
/// The `public_key` inside the payload is the station's own key, so that a
/// peer which opened the seal can immediately seal messages back.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub ip: String,
    pub port: u16,
    pub public_key: PublicKey,
    /// Milliseconds since the epoch.
    pub last_seen: u64,
}

/// Derive a symmetric key from the pre-shared discovery secret.
fn contact_key(shared_secret: &str) -> Key {
    let hk = Hkdf::<Sha256>::new(Some(CONTACT_CONTEXT), shared_secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key)
        .expect("seal::contact_key: 32 bytes is a valid HKDF output length");

    Key::from(key)
}

/// Derive a symmetric key from an x25519 shared point.
fn message_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Key {
    let hk = Hkdf::<Sha256>::new(Some(MESSAGE_CONTEXT), shared);
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(ephemeral.as_bytes());
    info.extend_from_slice(recipient.as_bytes());

    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .expect("seal::message_key: 32 bytes is a valid HKDF output length");

    Key::from(key)
}

fn fresh_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal contact information under the shared discovery secret.
///
/// Output is base64 of `nonce || ciphertext`.
pub fn encrypt_contact(contact: &ContactInfo, shared_secret: &str) -> Result<String, Error> {
    let plaintext = serde_json::to_vec(contact)?;
    let cipher = ChaCha20Poly1305::new(&contact_key(shared_secret));
    let nonce = fresh_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| Error::Decrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(BASE64_STANDARD.encode(sealed))
}

/// Open a sealed contact blob with the shared discovery secret.
pub fn decrypt_contact(sealed: &str, shared_secret: &str) -> Result<ContactInfo, Error> {
    let sealed = BASE64_STANDARD.decode(sealed)?;
    if sealed.len() < NONCE_SIZE {
        return Err(Error::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(&contact_key(shared_secret));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decrypt)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Seal a message to the recipient's public key.
///
/// Wire layout is `ephemeral_pk || nonce || ciphertext`.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, Error> {
    let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pk = PublicKey::from(*x25519_dalek::PublicKey::from(&ephemeral).as_bytes());
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(*recipient.as_bytes()));

    let cipher = ChaCha20Poly1305::new(&message_key(shared.as_bytes(), &ephemeral_pk, recipient));
    let nonce = fresh_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Decrypt)?;

    let mut sealed = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(ephemeral_pk.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(sealed)
}

/// Prove possession of `secret` to the holder of `peer`'s secret key, over
/// a challenge `nonce` the peer picked.
///
/// Anyone can *see* both public keys; only the two key holders can compute
/// the static agreement the tag is keyed by.
pub fn prove(secret: &SecretKey, peer: &PublicKey, nonce: &[u8]) -> Vec<u8> {
    proof_tag(secret, peer, nonce).to_vec()
}

/// Check a possession proof for the challenge `nonce` we issued, where
/// `peer` is the public key of the station the prover claims to be.
///
/// Constant-time over the tag bytes.
pub fn verify(secret: &SecretKey, peer: &PublicKey, nonce: &[u8], proof: &[u8]) -> bool {
    if proof.len() != PROOF_SIZE {
        return false;
    }
    let expected = proof_tag(secret, peer, nonce);
    proof
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// The proof tag: HKDF over the static x25519 agreement, bound to both
/// identities (order-independently, so both sides derive the same tag) and
/// to the challenge nonce.
fn proof_tag(secret: &SecretKey, peer: &PublicKey, nonce: &[u8]) -> [u8; PROOF_SIZE] {
    let shared = secret
        .0
        .diffie_hellman(&x25519_dalek::PublicKey::from(*peer.as_bytes()));
    let ours = secret.public_key();
    let (lo, hi) = if ours.as_bytes() <= peer.as_bytes() {
        (ours, *peer)
    } else {
        (*peer, ours)
    };

    let hk = Hkdf::<Sha256>::new(Some(AUTH_CONTEXT), shared.as_bytes());
    let mut info = Vec::with_capacity(64 + nonce.len());
    info.extend_from_slice(lo.as_bytes());
    info.extend_from_slice(hi.as_bytes());
    info.extend_from_slice(nonce);

    let mut tag = [0u8; PROOF_SIZE];
    hk.expand(&info, &mut tag)
        .expect("seal::proof_tag: 32 bytes is a valid HKDF output length");
    tag
}

/// Open a sealed message with our secret key.
pub fn decrypt(sealed: &[u8], secret: &SecretKey) -> Result<Vec<u8>, Error> {
    if sealed.len() < 32 + NONCE_SIZE {
        return Err(Error::Truncated(sealed.len()));
    }
    let (ephemeral, rest) = sealed.split_at(32);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let ephemeral_bytes: [u8; 32] = ephemeral
        .try_into()
        .expect("seal::decrypt: split_at(32) yields exactly 32 bytes");
    let ephemeral_pk = PublicKey::from(ephemeral_bytes);
    let recipient = secret.public_key();
    let shared = secret
        .0
        .diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_bytes));

    let cipher = ChaCha20Poly1305::new(&message_key(shared.as_bytes(), &ephemeral_pk, &recipient));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decrypt)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::KeyPair;

    fn contact(kp: &KeyPair) -> ContactInfo {
        ContactInfo {
            ip: "198.51.100.7".to_owned(),
            port: 8447,
            public_key: kp.public,
            last_seen: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_contact_roundtrip() {
        let kp = KeyPair::from_seed(1);
        let sealed = encrypt_contact(&contact(&kp), "swordfish").unwrap();
        let opened = decrypt_contact(&sealed, "swordfish").unwrap();

        assert_eq!(opened, contact(&kp));
    }

    #[test]
    fn test_contact_wrong_secret() {
        let kp = KeyPair::from_seed(1);
        let sealed = encrypt_contact(&contact(&kp), "swordfish").unwrap();

        assert!(matches!(
            decrypt_contact(&sealed, "marlin"),
            Err(Error::Decrypt)
        ));
    }

    #[test]
    fn test_contact_tamper() {
        let kp = KeyPair::from_seed(1);
        let sealed = encrypt_contact(&contact(&kp), "swordfish").unwrap();
        let mut bytes = BASE64_STANDARD.decode(sealed).unwrap();

        for i in 0..bytes.len() {
            bytes[i] ^= 0x01;
            let tampered = BASE64_STANDARD.encode(&bytes);
            assert!(
                decrypt_contact(&tampered, "swordfish").is_err(),
                "tampering byte {i} must not go unnoticed"
            );
            bytes[i] ^= 0x01;
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let kp = KeyPair::from_seed(2);
        let sealed = encrypt(b"hello bob", &kp.public).unwrap();

        assert_eq!(decrypt(&sealed, &kp.secret).unwrap(), b"hello bob");
    }

    #[test]
    fn test_message_wrong_key() {
        let alice = KeyPair::from_seed(2);
        let eve = KeyPair::from_seed(3);
        let sealed = encrypt(b"hello bob", &alice.public).unwrap();

        assert!(matches!(decrypt(&sealed, &eve.secret), Err(Error::Decrypt)));
    }

    #[test]
    fn test_message_tamper() {
        let kp = KeyPair::from_seed(4);
        let mut sealed = encrypt(b"hello bob", &kp.public).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(decrypt(&sealed, &kp.secret).is_err());
    }

    #[test]
    fn test_message_truncated() {
        let kp = KeyPair::from_seed(5);
        assert!(matches!(
            decrypt(&[0u8; 16], &kp.secret),
            Err(Error::Truncated(16))
        ));
    }

    #[test]
    fn test_proof_is_symmetric() {
        let alice = KeyPair::from_seed(7);
        let bob = KeyPair::from_seed(8);
        let nonce = b"challenge-from-bob";

        // Alice proves to bob; bob verifies against alice's public key.
        let proof = prove(&alice.secret, &bob.public, nonce);
        assert!(verify(&bob.secret, &alice.public, nonce, &proof));

        // And the other way around, with a different challenge.
        let proof = prove(&bob.secret, &alice.public, b"from-alice");
        assert!(verify(&alice.secret, &bob.public, b"from-alice", &proof));
    }

    #[test]
    fn test_proof_requires_the_claimed_secret() {
        let alice = KeyPair::from_seed(7);
        let bob = KeyPair::from_seed(8);
        let mallory = KeyPair::from_seed(9);
        let nonce = b"challenge-from-bob";

        // Mallory claims to be alice but proves with her own key: bob, who
        // verifies against alice's public key, must reject.
        let forged = prove(&mallory.secret, &bob.public, nonce);
        assert!(!verify(&bob.secret, &alice.public, nonce, &forged));

        // Replaying a proof under a different nonce fails too.
        let proof = prove(&alice.secret, &bob.public, nonce);
        assert!(!verify(&bob.secret, &alice.public, b"other-nonce", &proof));

        // As does a proof of the wrong size.
        assert!(!verify(&bob.secret, &alice.public, nonce, &proof[1..]));
    }

    #[test]
    fn test_seals_are_randomized() {
        let kp = KeyPair::from_seed(6);
        let a = encrypt(b"same text", &kp.public).unwrap();
        let b = encrypt(b"same text", &kp.public).unwrap();

        assert_ne!(a, b);
    }
}
