//! Client side of registration and login.
//!
//! Registration generates the user's key pair, stores the private key
//! encrypted under the LocalKey, and sends only the ServerProof, the
//! encrypted blob and the public key to the server.

use base64::{engine::general_purpose::STANDARD, Engine};

use dc_crypto::{LocalKey, PasswordMaterial, PrivateKey, PublicKey};
use dc_proto::{
    records::{LoginRequest, RegisterRequest},
    validate_username, PROTOCOL_VERSION,
};

use crate::error::{DomainError, Result, SuggestedAction};
use crate::keyfile::KeyFileStore;

pub struct Registration {
    pub request: RegisterRequest,
    pub public_key: PublicKey,
    /// Private key encrypted under the LocalKey, for [`store_key_file`].
    pub key_file: Vec<u8>,
}

/// Build a `Register` request for `username`. Nothing is written locally
/// until the server accepts the name.
pub fn prepare_registration(username: &str, password: &str) -> Result<Registration> {
    validate_username(username)
        .map_err(|m| DomainError::new(m, SuggestedAction::ReturnToRegister))?;
    if password.is_empty() {
        return Err(DomainError::new("password must not be empty", SuggestedAction::ReturnToRegister).into());
    }

    let material = PasswordMaterial::derive(password);
    let key = PrivateKey::generate();
    let public_key = key.public_key();
    let blob = key.protect(&material.local_key)?;

    tracing::info!(
        target: "dc_core",
        event = "key_generated",
        username,
        fingerprint = %public_key.fingerprint()
    );

    Ok(Registration {
        request: RegisterRequest {
            username: username.to_string(),
            server_proof: material.server_proof.to_hex(),
            encrypted_private_key: STANDARD.encode(&blob),
            armored_public_key: public_key.to_armored(),
        },
        public_key,
        key_file: blob,
    })
}

/// Write an accepted registration's protected key for `username`.
pub async fn store_key_file(keyfiles: &dyn KeyFileStore, username: &str, key_file: &[u8]) -> Result<()> {
    keyfiles.write_file(key_file, username).await?;
    tracing::info!(target: "dc_core", event = "key_file_written", username);
    Ok(())
}

/// Build a `Login` request. The LocalKey is returned for decrypting the
/// key file once the server accepts the login.
pub fn prepare_login(username: &str, password: &str) -> (LoginRequest, LocalKey) {
    let material = PasswordMaterial::derive(password);
    let request = LoginRequest {
        username: username.to_string(),
        server_proof: material.server_proof.to_hex(),
        version: PROTOCOL_VERSION.to_string(),
    };
    (request, material.local_key)
}

/// Load and decrypt `username`'s key file. Any failure, missing file or
/// wrong key alike, is a domain error.
pub async fn load_private_key(
    keyfiles: &dyn KeyFileStore,
    username: &str,
    local_key: &LocalKey,
) -> std::result::Result<PrivateKey, DomainError> {
    let unable = || {
        DomainError::new(
            format!("unable to load private key for {username}"),
            SuggestedAction::Continue,
        )
    };
    let blob = keyfiles.load_file(username).await.map_err(|e| {
        tracing::warn!(target: "dc_core", username, error = %e, "key file unavailable");
        unable()
    })?;
    PrivateKey::unprotect(&blob, local_key).map_err(|e| {
        tracing::warn!(target: "dc_core", username, error = %e, "key file did not decrypt");
        unable()
    })
}
