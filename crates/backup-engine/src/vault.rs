//! Encrypts storage credentials at rest with a per-installation key.
//!
//! The key is generated once and kept in its own file, away from the database, so a copy of
//! the database alone does not reveal the credentials. Ciphertexts use a versioned envelope:
//! `version || nonce || ciphertext`, base64 encoded.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current envelope version.
const ENVELOPE_VERSION: u8 = 1;

const NONCE_LENGTH: usize = 12;

/// Key material that zeroizes on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    key: [u8; 32],
}

/// The credential vault.
pub struct Vault {
    key: KeyMaterial,
}

impl Vault {
    /// Load the key from `key_file`, generating and persisting a new one if it does not exist.
    pub fn open_or_create(key_file: &Path) -> Result<Self, VaultError> {
        if key_file.exists() {
            let contents = fs::read_to_string(key_file).map_err(VaultError::ReadKey)?;
            let mut decoded = BASE64.decode(contents.trim())?;

            let key: [u8; 32] = decoded
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::InvalidKeySize(decoded.len()))?;
            decoded.zeroize();

            return Ok(Self {
                key: KeyMaterial { key },
            });
        }

        if let Some(parent) = key_file.parent() {
            fs::create_dir_all(parent).map_err(VaultError::WriteKey)?;
        }

        let vault = Self::generate();

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(key_file).map_err(VaultError::WriteKey)?;
        let mut encoded = BASE64.encode(vault.key.key);
        file.write_all(encoded.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(VaultError::WriteKey)?;
        encoded.zeroize();

        info!("Generated a new vault key at {key_file:?}");

        Ok(vault)
    }

    /// A vault with a fresh random key that is not persisted.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        Self {
            key: KeyMaterial { key },
        }
    }

    /// Encrypt `plaintext` into a base64 envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key.key)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LENGTH + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(envelope))
    }

    /// Decrypt a base64 envelope produced by [`Vault::encrypt`].
    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, VaultError> {
        let envelope = BASE64.decode(envelope)?;

        let Some((&version, rest)) = envelope.split_first() else {
            return Err(VaultError::TooShort(0));
        };
        if version != ENVELOPE_VERSION {
            return Err(VaultError::UnsupportedVersion(version));
        }
        if rest.len() <= NONCE_LENGTH {
            return Err(VaultError::TooShort(envelope.len()));
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.key.key)
            .map_err(|e| VaultError::Decrypt(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| VaultError::Decrypt(e.to_string()))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Failed to read the vault key:\n{0}")]
    ReadKey(#[source] io::Error),

    #[error("Failed to write the vault key:\n{0}")]
    WriteKey(#[source] io::Error),

    #[error("Invalid key size: expected 32 bytes, got {0}")]
    InvalidKeySize(usize),

    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
