//! The stored remote credential: an encrypted key pair plus plaintext location.
//!
//! Secrets are write-only. Reads return [`REDACTED`] in their place, and writes that carry a
//! blank or redacted value keep the previous ciphertext.

use core::fmt;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    database::{Database, to_millis},
    vault::{Vault, VaultError},
};

/// The marker shown in place of a stored secret.
pub const REDACTED: &str = "********";

/// An access key pair for the remote object store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AccessKey {
    /// The access key id.
    pub access_key_id: String,
    /// The secret access key.
    pub secret_access_key: String,
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKey")
            .field("access_key_id", &REDACTED)
            .field("secret_access_key", &REDACTED)
            .finish()
    }
}

/// Where the remote object store is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    /// Base URL of the S3 compatible endpoint.
    pub endpoint: String,
    /// The bucket artifacts are stored in.
    pub bucket: String,
    /// The signing region.
    pub region: String,
}

/// Decrypted remote credentials. Only ever held transiently by the storage backend.
#[derive(Clone, Debug)]
pub struct RemoteCredentials {
    /// Where the store is.
    pub location: RemoteLocation,
    /// How to authenticate.
    pub key: AccessKey,
}

/// A request to change the stored credentials.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CredentialUpdate {
    /// Base URL of the S3 compatible endpoint.
    pub endpoint: String,
    /// The bucket.
    pub bucket: String,
    /// The signing region.
    pub region: String,
    /// Blank or [`REDACTED`] keeps the stored value.
    pub access_key_id: String,
    /// Blank or [`REDACTED`] keeps the stored value.
    pub secret_access_key: String,
}

/// What callers may see of the stored credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialView {
    /// Base URL of the S3 compatible endpoint.
    pub endpoint: String,
    /// The bucket.
    pub bucket: String,
    /// The signing region.
    pub region: String,
    /// Always [`REDACTED`].
    pub access_key_id: &'static str,
    /// Always [`REDACTED`].
    pub secret_access_key: &'static str,
}

fn is_unchanged(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == REDACTED
}

/// Reads and writes the single stored credential row.
pub struct CredentialStore {
    database: Arc<Database>,
    vault: Vault,
}

impl CredentialStore {
    /// Create a store over the database, encrypting with the vault.
    pub fn new(database: Arc<Database>, vault: Vault) -> Self {
        Self { database, vault }
    }

    /// The redacted view of the stored credentials, if any are stored.
    pub fn view(&self) -> Result<Option<CredentialView>, CredentialError> {
        Ok(self.load_row()?.map(|(_, location)| CredentialView {
            endpoint: location.endpoint,
            bucket: location.bucket,
            region: location.region,
            access_key_id: REDACTED,
            secret_access_key: REDACTED,
        }))
    }

    /// Decrypt the stored credentials.
    pub fn load(&self) -> Result<Option<RemoteCredentials>, CredentialError> {
        let Some((ciphertext, location)) = self.load_row()? else {
            return Ok(None);
        };

        let mut plaintext = self.vault.decrypt(&ciphertext)?;
        let key: Result<AccessKey, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();

        Ok(Some(RemoteCredentials {
            location,
            key: key.map_err(CredentialError::Corrupt)?,
        }))
    }

    /// Resolve an update against the stored credentials without persisting anything.
    /// Blank or redacted secrets are filled from the stored values.
    pub fn resolve(&self, update: &CredentialUpdate) -> Result<RemoteCredentials, CredentialError> {
        let previous = self.load()?;

        let pick = |value: &str, previous: Option<&str>, field: &'static str| {
            if is_unchanged(value) {
                previous
                    .map(str::to_string)
                    .ok_or(CredentialError::Missing(field))
            } else {
                Ok(value.trim().to_string())
            }
        };

        let key = AccessKey {
            access_key_id: pick(
                &update.access_key_id,
                previous.as_ref().map(|p| p.key.access_key_id.as_str()),
                "access key id",
            )?,
            secret_access_key: pick(
                &update.secret_access_key,
                previous.as_ref().map(|p| p.key.secret_access_key.as_str()),
                "secret access key",
            )?,
        };

        for (value, field) in [
            (&update.endpoint, "endpoint"),
            (&update.bucket, "bucket"),
            (&update.region, "region"),
        ] {
            if value.trim().is_empty() {
                return Err(CredentialError::Missing(field));
            }
        }

        Ok(RemoteCredentials {
            location: RemoteLocation {
                endpoint: update.endpoint.trim().to_string(),
                bucket: update.bucket.trim().to_string(),
                region: update.region.trim().to_string(),
            },
            key,
        })
    }

    /// Persist credentials, replacing the stored row.
    pub fn save(&self, credentials: &RemoteCredentials) -> Result<(), CredentialError> {
        let mut plaintext = serde_json::to_vec(&credentials.key).map_err(CredentialError::Corrupt)?;
        let ciphertext = self.vault.encrypt(&plaintext);
        plaintext.zeroize();
        let ciphertext = ciphertext?;

        let location = &credentials.location;
        self.database.connection().execute(
            "INSERT INTO stored_credential (id, ciphertext, endpoint, bucket, region, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                endpoint = excluded.endpoint,
                bucket = excluded.bucket,
                region = excluded.region,
                updated_at = excluded.updated_at",
            params![
                ciphertext,
                location.endpoint,
                location.bucket,
                location.region,
                to_millis(Utc::now())
            ],
        )?;

        Ok(())
    }

    /// The raw ciphertext, for checking that it was left untouched.
    pub fn ciphertext(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.load_row()?.map(|(ciphertext, _)| ciphertext))
    }

    fn load_row(&self) -> Result<Option<(String, RemoteLocation)>, CredentialError> {
        let row = self
            .database
            .connection()
            .query_row(
                "SELECT ciphertext, endpoint, bucket, region FROM stored_credential WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        RemoteLocation {
                            endpoint: row.get(1)?,
                            bucket: row.get(2)?,
                            region: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()?;

        Ok(row)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to access stored credentials:\n{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to decrypt stored credentials:\n{0}")]
    Vault(#[from] VaultError),

    #[error("Stored credentials are corrupt:\n{0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("No {0} was given and none is stored")]
    Missing(&'static str),
}
