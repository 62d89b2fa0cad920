//! Credential persistence.
//!
//! The credential pair and the signed-in profile are stored under separate
//! keys so that one can be cleared without the other. The default store
//! keeps both in the OS keychain, serialized as JSON.

use std::sync::Mutex;

use keyring::Entry;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::models::UserProfile;

/// Keychain service name
const SERVICE_NAME: &str = "gymtrack";

/// Keychain entry holding the serialized credential pair
const CREDENTIAL_KEY: &str = "credential";

/// Keychain entry holding the serialized profile
const PROFILE_KEY: &str = "profile";

/// Access and refresh token pair.
///
/// Either absent entirely (signed out) or fully populated; a
/// half-populated pair is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub refresh_token: String,
}

impl Credential {
    /// True when both tokens are present.
    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.refresh_token.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("stored value is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("refusing to persist a half-populated credential")]
    IncompleteCredential,
}

/// Durable storage for the credential pair and the signed-in profile.
///
/// Operations are atomic with respect to each other from the caller's
/// perspective. A missing value is `Ok(None)`, not an error; failures are
/// surfaced to the caller, never swallowed.
pub trait CredentialStore: Send + Sync {
    fn credential(&self) -> Result<Option<Credential>, StorageError>;
    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError>;
    fn remove_credential(&self) -> Result<(), StorageError>;

    fn profile(&self) -> Result<Option<UserProfile>, StorageError>;
    fn save_profile(&self, profile: &UserProfile) -> Result<(), StorageError>;
    fn remove_profile(&self) -> Result<(), StorageError>;
}

/// Credential store backed by the OS keychain.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Use a custom keychain service name, e.g. one per backend environment.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let entry = Entry::new(&self.service, key)?;
        match entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let entry = Entry::new(&self.service, key)?;
        entry.set_password(&serde_json::to_string(value)?)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let entry = Entry::new(&self.service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn credential(&self) -> Result<Option<Credential>, StorageError> {
        self.read(CREDENTIAL_KEY)
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        if !credential.is_complete() {
            return Err(StorageError::IncompleteCredential);
        }
        self.write(CREDENTIAL_KEY, credential)
    }

    fn remove_credential(&self) -> Result<(), StorageError> {
        self.delete(CREDENTIAL_KEY)
    }

    fn profile(&self) -> Result<Option<UserProfile>, StorageError> {
        self.read(PROFILE_KEY)
    }

    fn save_profile(&self, profile: &UserProfile) -> Result<(), StorageError> {
        self.write(PROFILE_KEY, profile)
    }

    fn remove_profile(&self) -> Result<(), StorageError> {
        self.delete(PROFILE_KEY)
    }
}

/// In-memory credential store for tests and platforms without a keychain.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    credential: Option<Credential>,
    profile: Option<UserProfile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn credential(&self) -> Result<Option<Credential>, StorageError> {
        Ok(self.inner.lock().unwrap().credential.clone())
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        if !credential.is_complete() {
            return Err(StorageError::IncompleteCredential);
        }
        self.inner.lock().unwrap().credential = Some(credential.clone());
        Ok(())
    }

    fn remove_credential(&self) -> Result<(), StorageError> {
        self.inner.lock().unwrap().credential = None;
        Ok(())
    }

    fn profile(&self) -> Result<Option<UserProfile>, StorageError> {
        Ok(self.inner.lock().unwrap().profile.clone())
    }

    fn save_profile(&self, profile: &UserProfile) -> Result<(), StorageError> {
        self.inner.lock().unwrap().profile = Some(profile.clone());
        Ok(())
    }

    fn remove_profile(&self) -> Result<(), StorageError> {
        self.inner.lock().unwrap().profile = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_credential_shape_uses_camel_case() {
        let credential = Credential {
            token: "T1".to_string(),
            refresh_token: "R1".to_string(),
        };

        let value = serde_json::to_value(&credential).unwrap();
        assert_eq!(value["token"], "T1");
        assert_eq!(value["refreshToken"], "R1");
    }

    #[test]
    fn half_populated_credential_is_rejected() {
        let store = MemoryStore::new();
        let missing_refresh = Credential {
            token: "T1".to_string(),
            refresh_token: String::new(),
        };

        let err = store.save_credential(&missing_refresh).unwrap_err();
        assert!(matches!(err, StorageError::IncompleteCredential));
        assert!(store.credential().unwrap().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MemoryStore::new();
        store.remove_credential().unwrap();
        store.remove_profile().unwrap();
        assert!(store.credential().unwrap().is_none());
    }
}
