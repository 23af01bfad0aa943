use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{Cipher, StoreError};

type Tables = BTreeMap<String, BTreeMap<String, Value>>;

/// Table-scoped key-value storage.
///
/// Implementations must be safe to share between concurrent sessions.
pub trait Database: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, table: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Removes `key` from `table`. Missing keys are not an error.
    fn unset(&self, table: &str, key: &str) -> Result<(), StoreError>;

    /// Removes a whole table.
    fn drop_table(&self, table: &str) -> Result<(), StoreError>;

    /// Lists the keys of `table`.
    fn keys(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Cipher used for the encrypted-value variants.
    fn cipher(&self) -> &Cipher;
}

/// Database kept in memory and optionally persisted to a JSON file.
///
/// Every mutation rewrites the file while the write lock is held, so the
/// on-disk document always matches a consistent in-memory state. A mutation
/// that cannot be written is not applied.
pub struct JsonDatabase {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
    cipher: Cipher,
}

impl JsonDatabase {
    /// Creates a database that lives only in memory, with a random cipher key.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(Tables::new()),
            cipher: Cipher::generate(),
        }
    }

    /// Opens (or creates) a database file. Encrypted values are sealed with a
    /// key derived from `passphrase`.
    pub fn open(path: PathBuf, passphrase: &str) -> Result<Self, StoreError> {
        let tables = load_tables(&path)?;
        Ok(Self {
            path: Some(path),
            tables: RwLock::new(tables),
            cipher: Cipher::from_passphrase(passphrase),
        })
    }

    fn mutate<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tables),
    {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if self.path.is_none() {
            f(&mut tables);
            return Ok(());
        }
        // Memory only changes once the new document is on disk.
        let mut next = tables.clone();
        f(&mut next);
        self.persist(&next)?;
        *tables = next;
        Ok(())
    }

    /// Writes the tables to disk (no-op for in-memory databases).
    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(tables)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("persisted {} table(s) to {:?}", tables.len(), path);
        Ok(())
    }
}

impl Database for JsonDatabase {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn set(&self, table: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(|tables| {
            tables
                .entry(table.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    fn unset(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            if let Some(t) = tables.get_mut(table) {
                t.remove(key);
                if t.is_empty() {
                    tables.remove(table);
                }
            }
        })
    }

    fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            tables.remove(table);
        })
    }

    fn keys(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn cipher(&self) -> &Cipher {
        &self.cipher
    }
}

/// Loads tables from a JSON file on disk.
fn load_tables(path: &Path) -> Result<Tables, StoreError> {
    if !path.exists() {
        return Ok(Tables::new());
    }
    let data = std::fs::read_to_string(path)?;
    let tables: Tables = serde_json::from_str(&data)?;
    debug!("loaded {} table(s) from {:?}", tables.len(), path);
    Ok(tables)
}

/// Typed handle on one table of a [`Database`].
#[derive(Clone)]
pub struct Table {
    db: Arc<dyn Database>,
    name: String,
}

impl Table {
    pub fn new(db: Arc<dyn Database>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads and decodes a value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.db.get(&self.name, key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Encodes and stores a value.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.db.set(&self.name, key, serde_json::to_value(value)?)
    }

    /// Reads a value stored with [`crypt_set`](Self::crypt_set).
    pub fn crypt_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(Value::String(sealed)) = self.db.get(&self.name, key)? else {
            return Ok(None);
        };
        let plain = self.db.cipher().decrypt(&sealed)?;
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    /// Stores a value encrypted with the database cipher.
    pub fn crypt_set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let plain = serde_json::to_vec(value)?;
        let sealed = self.db.cipher().encrypt(&plain)?;
        self.db.set(&self.name, key, Value::String(sealed))
    }

    pub fn unset(&self, key: &str) -> Result<(), StoreError> {
        self.db.unset(&self.name, key)
    }

    pub fn drop_table(&self) -> Result<(), StoreError> {
        self.db.drop_table(&self.name)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.db.keys(&self.name)
    }
}
