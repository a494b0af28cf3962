//! Sealed message bodies.
//!
//! A body is sealed to the recipient's long-term public key with a fresh
//! ephemeral X25519 key:
//!
//! ```text
//!   shared  = X25519(ephemeral_secret, recipient_public)
//!   key     = HKDF-SHA256(shared, salt = eph_pub || recipient_pub, "dc-seal-v1")
//!   sealed  = eph_pub (32) || aead::encrypt(key, body, aad = eph_pub)
//! ```
//!
//! Only the holder of the recipient private key can open it. The server
//! relays sealed bytes without being able to read them.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::{
    aead,
    error::CryptoError,
    kdf::derive_key_32,
    keys::{PrivateKey, PublicKey, KEY_LEN},
};

const SEAL_INFO: &[u8] = b"dc-seal-v1";

fn seal_salt(eph_pub: &[u8; KEY_LEN], recipient: &[u8; KEY_LEN]) -> [u8; KEY_LEN * 2] {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(eph_pub);
    salt[KEY_LEN..].copy_from_slice(recipient);
    salt
}

/// Encrypt `plaintext` so only the owner of `recipient` can read it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph_secret);

    let shared = eph_secret.diffie_hellman(recipient.inner());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order recipient key".into()));
    }

    let salt = seal_salt(eph_pub.as_bytes(), recipient.as_bytes());
    let key = derive_key_32(shared.as_bytes(), &salt, SEAL_INFO)?;
    let body = aead::encrypt(&key, plaintext, eph_pub.as_bytes())?;

    let mut out = Vec::with_capacity(KEY_LEN + body.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open a body produced by [`seal`].
pub fn open(recipient: &PrivateKey, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < KEY_LEN + aead::NONCE_LEN + aead::TAG_LEN {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }
    let (eph_bytes, body) = sealed.split_at(KEY_LEN);
    let eph_pub = PublicKey::from_bytes(eph_bytes)?;

    let shared = recipient.diffie_hellman(&eph_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::AeadDecrypt);
    }

    let salt = seal_salt(eph_pub.as_bytes(), recipient.public_key().as_bytes());
    let key = derive_key_32(shared.as_bytes(), &salt, SEAL_INFO)?;
    aead::decrypt(&key, body, eph_pub.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::PasswordMaterial;

    #[test]
    fn seal_open_roundtrip() {
        let bob = PrivateKey::generate();
        let sealed = seal(&bob.public_key(), b"hi bob").unwrap();
        assert_eq!(open(&bob, &sealed).unwrap().as_slice(), b"hi bob");
    }

    #[test]
    fn sealing_is_randomized() {
        let bob = PrivateKey::generate();
        let a = seal(&bob.public_key(), b"same").unwrap();
        let b = seal(&bob.public_key(), b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn other_key_cannot_open() {
        let bob = PrivateKey::generate();
        let eve = PrivateKey::generate();
        let sealed = seal(&bob.public_key(), b"secret").unwrap();
        assert!(matches!(open(&eve, &sealed), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bob = PrivateKey::generate();
        assert!(matches!(
            open(&bob, &[0u8; 40]),
            Err(CryptoError::SealedTooShort(40))
        ));
    }

    /// Key generated under pw1, stored, reloaded under pw1: it still opens
    /// what was sealed to it. Reloading under pw2 fails outright.
    #[test]
    fn reloaded_key_opens_and_wrong_password_fails() {
        let pw1 = PasswordMaterial::derive("pw1");
        let key = PrivateKey::generate();
        let public = key.public_key();
        let blob = key.protect(&pw1.local_key).unwrap();
        drop(key);

        let sealed = seal(&public, b"round trip").unwrap();

        let reloaded = PrivateKey::unprotect(&blob, &PasswordMaterial::derive("pw1").local_key).unwrap();
        assert_eq!(reloaded.public_key(), public);
        assert_eq!(open(&reloaded, &sealed).unwrap().as_slice(), b"round trip");

        let pw2 = PasswordMaterial::derive("pw2");
        assert!(PrivateKey::unprotect(&blob, &pw2.local_key).is_err());
    }
}
