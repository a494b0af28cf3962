//! Password-derived key material.
//!
//! One SHA-512 digest of the password is split into two disjoint ranges:
//!
//! ```text
//!   digest:  [ 0 ............ 32 | 32 ..... 48 | 48 .. 64 ]
//!              LocalKey            ServerProof   unused
//! ```
//!
//! - `LocalKey` encrypts the user's private key file. It never leaves the
//!   client.
//! - `ServerProof` is the register/login credential sent to the server.
//!
//! Knowing the proof does not let the server recompute the local key: the
//! ranges do not overlap and both are outputs of a one-way hash. Keep them
//! split; merging them would hand the server the key-file secret.

use std::fmt;
use std::ops::Range;

use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const LOCAL_KEY_LEN: usize = 32;
pub const SERVER_PROOF_LEN: usize = 16;

const LOCAL_KEY_RANGE: Range<usize> = 0..32;
const SERVER_PROOF_RANGE: Range<usize> = 32..48;

/// Key used to encrypt the private key file at rest. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalKey([u8; LOCAL_KEY_LEN]);

impl LocalKey {
    pub fn as_bytes(&self) -> &[u8; LOCAL_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalKey(<redacted>)")
    }
}

/// Authentication credential presented to the server.
#[derive(Clone, Copy)]
pub struct ServerProof([u8; SERVER_PROOF_LEN]);

impl ServerProof {
    pub fn from_bytes(bytes: [u8; SERVER_PROOF_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SERVER_PROOF_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; SERVER_PROOF_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!(
                "server proof must be {SERVER_PROOF_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &ServerProof) -> bool {
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl PartialEq for ServerProof {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for ServerProof {}

impl fmt::Debug for ServerProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerProof(<redacted>)")
    }
}

/// Both halves of the password digest.
#[derive(Debug, Clone)]
pub struct PasswordMaterial {
    pub local_key: LocalKey,
    pub server_proof: ServerProof,
}

impl PasswordMaterial {
    /// Deterministically derive the material for `password`.
    pub fn derive(password: &str) -> Self {
        let mut digest = Sha512::digest(password.as_bytes());

        let mut local = [0u8; LOCAL_KEY_LEN];
        local.copy_from_slice(&digest[LOCAL_KEY_RANGE]);
        let mut proof = [0u8; SERVER_PROOF_LEN];
        proof.copy_from_slice(&digest[SERVER_PROOF_RANGE]);

        digest.as_mut_slice().zeroize();
        Self {
            local_key: LocalKey(local),
            server_proof: ServerProof(proof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = PasswordMaterial::derive("pw1");
        let b = PasswordMaterial::derive("pw1");
        assert_eq!(a.local_key.as_bytes(), b.local_key.as_bytes());
        assert_eq!(a.server_proof, b.server_proof);
    }

    #[test]
    fn halves_are_disjoint_slices_of_sha512() {
        let material = PasswordMaterial::derive("correct horse battery staple");
        let digest = Sha512::digest(b"correct horse battery staple");
        assert_eq!(material.local_key.as_bytes().as_slice(), &digest[0..32]);
        assert_eq!(material.server_proof.as_bytes().as_slice(), &digest[32..48]);
        assert!(LOCAL_KEY_RANGE.end <= SERVER_PROOF_RANGE.start);
    }

    #[test]
    fn distinct_passwords_give_distinct_proofs() {
        let corpus = ["pw1", "pw2", "hunter2", "", "Pw1", "pw1 ", "пароль", "🔑🔑"];
        let proofs: Vec<ServerProof> = corpus
            .iter()
            .map(|p| PasswordMaterial::derive(p).server_proof)
            .collect();
        for i in 0..proofs.len() {
            for j in (i + 1)..proofs.len() {
                assert_ne!(proofs[i], proofs[j], "{:?} vs {:?}", corpus[i], corpus[j]);
            }
        }
    }

    #[test]
    fn proof_hex_roundtrip_and_length_check() {
        let proof = PasswordMaterial::derive("pw1").server_proof;
        let hex = proof.to_hex();
        assert_eq!(hex.len(), SERVER_PROOF_LEN * 2);
        assert_eq!(ServerProof::from_hex(&hex).unwrap(), proof);
        assert!(matches!(
            ServerProof::from_hex("abcd"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(ServerProof::from_hex("zz").is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let material = PasswordMaterial::derive("pw1");
        let shown = format!("{material:?}");
        assert!(!shown.contains(&material.server_proof.to_hex()));
        assert!(shown.contains("redacted"));
    }
}
