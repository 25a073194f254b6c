//! Durable storage for the credential registry.
//!
//! The registry persists its whole mapping on every flush. The file backend
//! writes a versioned JSON document through a temp file + rename, so a crash
//! mid-write leaves either the previous document or the new one on disk. A
//! missing file means "no registrations yet"; a file that exists but cannot be
//! decoded is reported as corrupt and never silently treated as empty.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use issuebot_core::write_text_atomic_with_mode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::{CredentialSecret, UserId};

pub const CREDENTIAL_STORE_SCHEMA_VERSION: u32 = 1;
const CREDENTIAL_STORE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read credential store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("unsupported credential store schema in {path}: expected {expected}, found {found}")]
    UnsupportedSchema {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("failed to write credential store {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("credential flush task failed: {0}")]
    FlushTask(String),
}

impl StorageError {
    /// True when the stored artifact exists but its contents were lost or mangled.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::UnsupportedSchema { .. })
    }
}

/// Mapping recovered from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub users: BTreeMap<UserId, CredentialSecret>,
    /// Set when the artifact used an older layout and should be rewritten.
    pub needs_rewrite: bool,
}

/// Storage medium for the `{user -> credential}` mapping.
///
/// Implementations are called from blocking contexts and must replace the
/// stored artifact atomically in [`CredentialStorage::store`].
pub trait CredentialStorage: Send + Sync {
    /// Returns `Ok(None)` when no artifact exists yet.
    fn load(&self) -> Result<Option<StoredCredentials>, StorageError>;

    fn store(&self, users: &BTreeMap<UserId, CredentialSecret>) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialStoreFile {
    schema_version: u32,
    #[serde(default)]
    users: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CredentialStoreDocument {
    Versioned(CredentialStoreFile),
    Legacy(BTreeMap<String, String>),
}

/// JSON file backend.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStorage {
    path: PathBuf,
}

impl JsonFileCredentialStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> StorageError {
        StorageError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn decode_users(
        &self,
        raw_users: BTreeMap<String, String>,
    ) -> Result<BTreeMap<UserId, CredentialSecret>, StorageError> {
        let mut users = BTreeMap::new();
        for (raw_user, raw_secret) in raw_users {
            let user_id = UserId::new(raw_user);
            if user_id.is_empty() {
                return Err(self.corrupt("entry with empty user id"));
            }
            let Some(secret) = CredentialSecret::new(raw_secret) else {
                return Err(self.corrupt(format!("entry for user {user_id} has an empty secret")));
            };
            users.insert(user_id, secret);
        }
        Ok(users)
    }
}

impl CredentialStorage for JsonFileCredentialStorage {
    fn load(&self) -> Result<Option<StoredCredentials>, StorageError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Err(self.corrupt("file is empty"));
        }

        let document = serde_json::from_str::<CredentialStoreDocument>(&raw)
            .map_err(|error| self.corrupt(format!("failed to decode json: {error}")))?;
        match document {
            CredentialStoreDocument::Versioned(file) => {
                if file.schema_version != CREDENTIAL_STORE_SCHEMA_VERSION {
                    return Err(StorageError::UnsupportedSchema {
                        path: self.path.clone(),
                        expected: CREDENTIAL_STORE_SCHEMA_VERSION,
                        found: file.schema_version,
                    });
                }
                Ok(Some(StoredCredentials {
                    users: self.decode_users(file.users)?,
                    needs_rewrite: false,
                }))
            }
            CredentialStoreDocument::Legacy(raw_users) => Ok(Some(StoredCredentials {
                users: self.decode_users(raw_users)?,
                needs_rewrite: true,
            })),
        }
    }

    fn store(&self, users: &BTreeMap<UserId, CredentialSecret>) -> Result<(), StorageError> {
        let file = CredentialStoreFile {
            schema_version: CREDENTIAL_STORE_SCHEMA_VERSION,
            users: users
                .iter()
                .map(|(user_id, secret)| (user_id.as_str().to_string(), secret.expose().to_string()))
                .collect(),
        };
        let mut payload =
            serde_json::to_string_pretty(&file).map_err(|error| StorageError::Write {
                path: self.path.clone(),
                message: format!("failed to serialize credential store: {error}"),
            })?;
        payload.push('\n');
        write_text_atomic_with_mode(&self.path, &payload, Some(CREDENTIAL_STORE_FILE_MODE))
            .map_err(|error| StorageError::Write {
                path: self.path.clone(),
                message: format!("{error:#}"),
            })
    }
}
