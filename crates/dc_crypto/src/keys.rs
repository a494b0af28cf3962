//! User key pairs.
//!
//! Each user owns one long-term X25519 key pair. The public half travels as
//! armored text; the private half exists in the clear only in session memory
//! and is otherwise kept in a key file encrypted under the user's `LocalKey`.
//!
//! Key file format: `aead::encrypt(LocalKey, secret_bytes, "dc-private-key-v1")`.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::{aead, error::CryptoError, password::LocalKey};

pub const KEY_LEN: usize = 32;

const ARMOR_LABEL: &str = "DARKLOCK COURIER PUBLIC KEY";
const PRIVATE_KEY_AAD: &[u8] = b"dc-private-key-v1";

fn to_32(bytes: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected {KEY_LEN}-byte key, got {}", bytes.len()))
    })
}

// ── Public key ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(X25519Public::from(to_32(bytes)?)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    pub(crate) fn inner(&self) -> &X25519Public {
        &self.0
    }

    /// ASCII armor with BEGIN/END lines around the base64 key.
    pub fn to_armored(&self) -> String {
        format!(
            "-----BEGIN {ARMOR_LABEL}-----\n{}\n-----END {ARMOR_LABEL}-----\n",
            STANDARD.encode(self.as_bytes())
        )
    }

    pub fn from_armored(text: &str) -> Result<Self, CryptoError> {
        let begin = format!("-----BEGIN {ARMOR_LABEL}-----");
        let end = format!("-----END {ARMOR_LABEL}-----");

        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some(begin.as_str()) {
            return Err(CryptoError::InvalidArmor("missing BEGIN line".into()));
        }
        let mut body = String::new();
        let mut closed = false;
        for line in lines.by_ref() {
            if line == end {
                closed = true;
                break;
            }
            body.push_str(line);
        }
        if !closed {
            return Err(CryptoError::InvalidArmor("missing END line".into()));
        }
        if lines.next().is_some() {
            return Err(CryptoError::InvalidArmor("trailing data after END line".into()));
        }
        let bytes = STANDARD.decode(body)?;
        Self::from_bytes(&bytes)
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.as_bytes());
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

// ── Private key ───────────────────────────────────────────────────────────────

/// Long-term X25519 secret. `StaticSecret` zeroizes itself on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(StaticSecret::from(to_32(bytes)?)))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.0.diffie_hellman(peer.inner())
    }

    /// Encrypt this key for storage under `local_key`.
    pub fn protect(&self, local_key: &LocalKey) -> Result<Vec<u8>, CryptoError> {
        let secret = self.to_bytes();
        aead::encrypt(local_key.as_bytes(), secret.as_ref(), PRIVATE_KEY_AAD)
    }

    /// Decrypt a key file produced by [`PrivateKey::protect`].
    ///
    /// Fails with [`CryptoError::AeadDecrypt`] when `local_key` is wrong.
    pub fn unprotect(blob: &[u8], local_key: &LocalKey) -> Result<Self, CryptoError> {
        let secret = aead::decrypt(local_key.as_bytes(), blob, PRIVATE_KEY_AAD)?;
        Self::from_bytes(&secret)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(<redacted>, public={})", self.public_key().fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::PasswordMaterial;

    #[test]
    fn armor_roundtrip() {
        let key = PrivateKey::generate();
        let armored = key.public_key().to_armored();
        assert!(armored.starts_with("-----BEGIN DARKLOCK COURIER PUBLIC KEY-----"));
        let parsed = PublicKey::from_armored(&armored).unwrap();
        assert_eq!(parsed, key.public_key());
    }

    #[test]
    fn armor_rejects_garbage() {
        assert!(matches!(
            PublicKey::from_armored("not a key"),
            Err(CryptoError::InvalidArmor(_))
        ));
        let truncated = "-----BEGIN DARKLOCK COURIER PUBLIC KEY-----\nAAAA\n";
        assert!(matches!(
            PublicKey::from_armored(truncated),
            Err(CryptoError::InvalidArmor(_))
        ));
        let short = "-----BEGIN DARKLOCK COURIER PUBLIC KEY-----\nAAAA\n-----END DARKLOCK COURIER PUBLIC KEY-----";
        assert!(matches!(
            PublicKey::from_armored(short),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn protected_key_roundtrip() {
        let material = PasswordMaterial::derive("pw1");
        let key = PrivateKey::generate();
        let blob = key.protect(&material.local_key).unwrap();
        let restored = PrivateKey::unprotect(&blob, &material.local_key).unwrap();
        assert_eq!(*restored.to_bytes(), *key.to_bytes());
    }

    #[test]
    fn protected_key_wrong_password_fails() {
        let key = PrivateKey::generate();
        let blob = key.protect(&PasswordMaterial::derive("pw1").local_key).unwrap();
        let wrong = PasswordMaterial::derive("pw2").local_key;
        assert!(matches!(
            PrivateKey::unprotect(&blob, &wrong),
            Err(CryptoError::AeadDecrypt)
        ));
    }

    #[test]
    fn fingerprint_is_grouped_hex() {
        let fp = PrivateKey::generate().public_key().fingerprint();
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 10);
        assert!(groups.iter().all(|g| g.len() == 4));
    }
}
