//! Credential persistence keyed by username.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{StoreError, Table};

/// Bearer credential issued by the token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Absolute expiry as unix seconds.
    pub expires: i64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires", &self.expires)
            .finish()
    }
}

impl Credential {
    /// Builds a credential that expires `expires_in` seconds from now.
    pub fn new(access_token: String, refresh_token: Option<String>, expires_in: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires: chrono::Utc::now().timestamp() + expires_in,
        }
    }

    /// True once `now >= expires`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires
    }

    /// Forces the next use to refresh.
    pub fn expire(&mut self) {
        self.expires = 0;
    }
}

/// Persistent credential storage.
///
/// Must be safe under concurrent calls from multiple sessions.
pub trait TokenStore: Send + Sync {
    fn save(&self, username: &str, credential: &Credential) -> Result<(), StoreError>;
    fn load(&self, username: &str) -> Result<Option<Credential>, StoreError>;
    fn delete(&self, username: &str) -> Result<(), StoreError>;
}

/// Token store that forgets everything when dropped.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all stored usernames.
    pub fn usernames(&self) -> Vec<String> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, username: &str, credential: &Credential) -> Result<(), StoreError> {
        let mut map = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(username.to_string(), credential.clone());
        Ok(())
    }

    fn load(&self, username: &str) -> Result<Option<Credential>, StoreError> {
        let map = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(username).cloned())
    }

    fn delete(&self, username: &str) -> Result<(), StoreError> {
        let mut map = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(username);
        Ok(())
    }
}

/// Token store backed by a database table; credentials are encrypted at rest.
pub struct DatabaseTokenStore {
    table: Table,
}

impl DatabaseTokenStore {
    pub fn new(table: Table) -> Self {
        Self { table }
    }
}

impl TokenStore for DatabaseTokenStore {
    fn save(&self, username: &str, credential: &Credential) -> Result<(), StoreError> {
        self.table.crypt_set(username, credential)?;
        debug!(user = username, "saved credential");
        Ok(())
    }

    fn load(&self, username: &str) -> Result<Option<Credential>, StoreError> {
        self.table.crypt_get(username)
    }

    fn delete(&self, username: &str) -> Result<(), StoreError> {
        self.table.unset(username)?;
        debug!(user = username, "deleted credential");
        Ok(())
    }
}
