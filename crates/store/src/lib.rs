//! Local persistence for kitebroker.
//!
//! Provides a table-scoped key-value [`Database`] (in memory or backed by a
//! JSON file), AES-256-GCM encryption for sensitive values, and the
//! [`TokenStore`] implementations the API client keeps credentials in.

mod crypt;
mod db;
mod token;

pub use crypt::Cipher;
pub use db::{Database, JsonDatabase, Table};
pub use token::{Credential, DatabaseTokenStore, MemoryTokenStore, TokenStore};

/// Errors produced by the store crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),
}
