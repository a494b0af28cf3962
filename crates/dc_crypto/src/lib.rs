//! dc_crypto - Darklock Courier cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - The server never receives anything that can open a client's key file.
//!
//! # Module layout
//! - `password` - SHA-512 password digest split into LocalKey / ServerProof
//! - `keys`     - X25519 user key pairs, armored public keys, key-file protection
//! - `seal`     - message bodies sealed to a recipient public key
//! - `aead`     - XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`      - HKDF-SHA256 expansion
//! - `error`    - unified error type

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod password;
pub mod seal;

pub use error::CryptoError;
pub use keys::{PrivateKey, PublicKey};
pub use password::{LocalKey, PasswordMaterial, ServerProof};
